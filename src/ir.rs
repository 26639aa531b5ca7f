// (C) 2020 Brandon Lewis
//
// The compiler's intermediate representation.
//
// Lowering turns every block of a patch into a fragment of an
// SSA-style expression DAG plus a handful of imperative artifacts:
// steps, state slots, instance declarations, render globals. The
// IrBuilder in this file is the write-only sink all of that flows
// into; the scheduler later decides what actually gets a slot and in
// which order steps run.
//
// *Invariants*
//
// A value expression is never rewritten after emission. CSE and DCE
// are the scheduler's business, keyed on expression fingerprints.
//
// Multi-component signals are materialized with Construct or a
// strided slot write; a consumer reading one component addresses the
// slot at base + offset. The two forms are equivalent.
//
// State slots read the previous tick's value and are written in the
// current tick. The scheduler enforces the phase separation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::shapes::PathTopology;
use crate::types::{CanonType, Domain, InstanceId, Payload};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId(pub u32);

// Base cell index into the runtime's flat value storage. A strided
// value occupies [slot, slot + stride) consecutive cells.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateIdx(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyId(pub u32);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConstVal {
    Float(f64),
    Int(i64),
    Bool(bool),
    Vec2([f64; 2]),
    Vec3([f64; 3]),
    Color([f64; 4]),
}

impl ConstVal {
    pub fn payload(&self) -> Payload {
        match self {
            ConstVal::Float(_) => Payload::Float,
            ConstVal::Int(_) => Payload::Int,
            ConstVal::Bool(_) => Payload::Bool,
            ConstVal::Vec2(_) => Payload::Vec2,
            ConstVal::Vec3(_) => Payload::Vec3,
            ConstVal::Color(_) => Payload::Color,
        }
    }
}

// Builder-registered scalar opcodes. Comparison opcodes yield 0/1 in
// the result payload; there is no silent coercion anywhere.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Abs,
    Floor,
    Sqrt,
    Sin,
    Cos,
    Min,
    Max,
    Lerp,
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
}

impl OpCode {
    pub fn arity(self) -> usize {
        use OpCode::*;
        match self {
            Neg | Abs | Floor | Sqrt | Sin | Cos => 1,
            Lerp => 3,
            _ => 2,
        }
    }
}

// Named field kernels. The compiler treats the bodies as opaque; only
// arity and output payload matter here, and both are checkable when a
// block definition is registered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelName {
    FieldSin,
    FieldCos,
    FieldMod,
    FieldPulse,
    RadiusSqrt,
    GoldenAngle,
    AngularOffset,
    HueFromPhase,
    JitterVec,
    SetZ,
    PolarToCartesian,
    CartesianAngle,
    CartesianRadius,
    PolygonVertex,
    StarVertex,
    EventMask,
}

impl KernelName {
    pub fn arity(self) -> usize {
        use KernelName::*;
        match self {
            FieldSin | FieldCos | RadiusSqrt | GoldenAngle | HueFromPhase | CartesianAngle
            | CartesianRadius | EventMask => 1,
            FieldMod | FieldPulse | AngularOffset | JitterVec | SetZ | PolarToCartesian => 2,
            PolygonVertex | StarVertex => 3,
        }
    }

    pub fn out_payload(self) -> Payload {
        use KernelName::*;
        match self {
            JitterVec | PolarToCartesian | PolygonVertex | StarVertex => Payload::Vec2,
            SetZ => Payload::Vec3,
            HueFromPhase => Payload::Color,
            _ => Payload::Float,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelRef {
    Op(OpCode),
    Named(KernelName),
}

impl KernelRef {
    pub fn arity(self) -> usize {
        match self {
            KernelRef::Op(op) => op.arity(),
            KernelRef::Named(k) => k.arity(),
        }
    }

    // Every kernel in the catalog is referentially transparent; purity
    // at scheduling is gated by the owning block's capability instead.
    pub fn is_pure(self) -> bool {
        true
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intrinsic {
    Time,
    LaneIndex,
    LaneCount,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueExpr {
    Const(ConstVal, CanonType),
    External(String, CanonType),
    Intrinsic(Intrinsic, CanonType),
    Map {
        src: ExprId,
        kernel: KernelRef,
        ty: CanonType,
    },
    Zip {
        srcs: Vec<ExprId>,
        kernel: KernelRef,
        ty: CanonType,
    },
    // Broadcast-zip a field with per-tick signals.
    ZipSig {
        field: ExprId,
        sigs: Vec<ExprId>,
        kernel: KernelRef,
        ty: CanonType,
    },
    // Pack scalar components into one multi-component value.
    Construct {
        parts: Vec<ExprId>,
        ty: CanonType,
    },
    Broadcast {
        sig: ExprId,
        ty: CanonType,
    },
    ShapeRef {
        topology: TopologyId,
        params: Vec<ExprId>,
        control: Option<ExprId>,
        ty: CanonType,
    },
    SlotRead {
        slot: Slot,
        ty: CanonType,
    },
    StateRead {
        state: StateIdx,
        ty: CanonType,
    },
    EventRead {
        event: EventId,
        ty: CanonType,
    },
}

impl ValueExpr {
    pub fn ty(&self) -> CanonType {
        match self {
            ValueExpr::Const(_, ty)
            | ValueExpr::External(_, ty)
            | ValueExpr::Intrinsic(_, ty)
            | ValueExpr::Map { ty, .. }
            | ValueExpr::Zip { ty, .. }
            | ValueExpr::ZipSig { ty, .. }
            | ValueExpr::Construct { ty, .. }
            | ValueExpr::Broadcast { ty, .. }
            | ValueExpr::ShapeRef { ty, .. }
            | ValueExpr::SlotRead { ty, .. }
            | ValueExpr::StateRead { ty, .. }
            | ValueExpr::EventRead { ty, .. } => *ty,
        }
    }

    // Direct children, in evaluation order.
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            ValueExpr::Const(..)
            | ValueExpr::External(..)
            | ValueExpr::Intrinsic(..)
            | ValueExpr::SlotRead { .. }
            | ValueExpr::StateRead { .. }
            | ValueExpr::EventRead { .. } => Vec::new(),
            ValueExpr::Map { src, .. } => vec![*src],
            ValueExpr::Zip { srcs, .. } => srcs.clone(),
            ValueExpr::ZipSig { field, sigs, .. } => {
                let mut v = vec![*field];
                v.extend(sigs.iter().cloned());
                v
            }
            ValueExpr::Construct { parts, .. } => parts.clone(),
            ValueExpr::Broadcast { sig, .. } => vec![*sig],
            ValueExpr::ShapeRef {
                params, control, ..
            } => {
                let mut v = params.clone();
                v.extend(control.iter().cloned());
                v
            }
        }
    }

    // Leaves never recompute anything, so emitting them twice is
    // harmless; the builder dedups them to keep the table small.
    pub fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }
}

// An emitted instruction the runtime executes each tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Step {
    Eval { expr: ExprId, slot: Slot },
    WriteStrided { slot: Slot, parts: Vec<ExprId> },
    StateWrite { state: StateIdx, expr: ExprId },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraProjection {
    Perspective,
    Orthographic,
}

// Runtime-opaque render declarations. The compiler validates and
// forwards them; it never interprets them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RenderGlobal {
    Camera {
        projection: CameraProjection,
        center: [f64; 2],
        distance: f64,
        tilt_deg: f64,
        yaw_deg: f64,
        fov_y_deg: f64,
        near: f64,
        far: f64,
    },
    Instances2D {
        instance: InstanceId,
        pos: Slot,
        color: Slot,
        scale: Option<Slot>,
        topology: Option<TopologyId>,
    },
}

// Stable identity of a state slot across recompiles. The instance
// half is the originating block's stable id string, so the runtime
// can carry memory over when the patch is edited elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub instance: String,
    pub role: String,
}

impl StateKey {
    pub fn new(instance: impl Into<String>, role: impl Into<String>) -> StateKey {
        StateKey {
            instance: instance.into(),
            role: role.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDecl {
    pub key: StateKey,
    pub init: ConstVal,
    pub ty: CanonType,
}

// A field domain of `count` lanes. `key` is the originating block's
// stable id; `shape` is the ShapeRef expression rendered for each
// lane, when one was wired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceDecl {
    pub id: InstanceId,
    pub key: String,
    pub domain: Domain,
    pub count: usize,
    pub shape: Option<ExprId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot: Slot,
    pub ty: CanonType,
    pub stride: usize,
    pub block: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EmittedStep {
    pub step: Step,
    pub block: u32,
}

// Everything lowering produced, handed to the scheduler.
pub struct IrParts {
    pub exprs: Vec<ValueExpr>,
    // Emitting block per expression, parallel to exprs. Deduped
    // leaves keep their first emitter.
    pub expr_block: Vec<u32>,
    pub slots: Vec<SlotInfo>,
    pub next_cell: u32,
    pub state: Vec<StateDecl>,
    pub instances: Vec<InstanceDecl>,
    pub events: Vec<String>,
    pub steps: Vec<EmittedStep>,
    pub render: Vec<(RenderGlobal, u32)>,
    pub topologies: Vec<PathTopology>,
}

// Write-only sink used by block lowering. All constructors are pure
// on their inputs and return stable handles; the step emitters and
// add_render_global are the only observable side-effects.
pub struct IrBuilder {
    exprs: Vec<ValueExpr>,
    expr_block: Vec<u32>,
    leaf_index: HashMap<String, ExprId>,
    slots: Vec<SlotInfo>,
    next_cell: u32,
    state: Vec<StateDecl>,
    state_index: HashMap<StateKey, StateIdx>,
    instances: Vec<InstanceDecl>,
    events: Vec<String>,
    steps: Vec<EmittedStep>,
    render: Vec<(RenderGlobal, u32)>,
    topologies: Vec<PathTopology>,
    topology_index: HashMap<String, TopologyId>,
    cur_block: u32,
}

impl IrBuilder {
    pub fn new() -> IrBuilder {
        IrBuilder {
            exprs: Vec::new(),
            expr_block: Vec::new(),
            leaf_index: HashMap::new(),
            slots: Vec::new(),
            next_cell: 0,
            state: Vec::new(),
            state_index: HashMap::new(),
            instances: Vec::new(),
            events: Vec::new(),
            steps: Vec::new(),
            render: Vec::new(),
            topologies: Vec::new(),
            topology_index: HashMap::new(),
            cur_block: 0,
        }
    }

    // The lowering driver sets this before invoking each block so
    // steps and slots carry attribution for the debug index.
    pub fn set_current_block(&mut self, block: u32) {
        self.cur_block = block;
    }

    pub fn current_block(&self) -> u32 {
        self.cur_block
    }

    pub fn expr(&mut self, e: ValueExpr) -> ExprId {
        if e.is_leaf() {
            // f64 has no Hash; equivalent leaves stringify identically.
            let key = format!("{:?}", e);
            if let Some(id) = self.leaf_index.get(&key) {
                return *id;
            }
            let id = ExprId(self.exprs.len() as u32);
            self.exprs.push(e);
            self.expr_block.push(self.cur_block);
            self.leaf_index.insert(key, id);
            id
        } else {
            let id = ExprId(self.exprs.len() as u32);
            self.exprs.push(e);
            self.expr_block.push(self.cur_block);
            id
        }
    }

    pub fn expr_at(&self, id: ExprId) -> &ValueExpr {
        &self.exprs[id.0 as usize]
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    // Shorthand constructors.

    pub fn const_val(&mut self, v: ConstVal, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::Const(v, ty))
    }

    pub fn const_f64(&mut self, v: f64, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::Const(ConstVal::Float(v), ty))
    }

    pub fn external(&mut self, channel: impl Into<String>, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::External(channel.into(), ty))
    }

    pub fn intrinsic(&mut self, which: Intrinsic, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::Intrinsic(which, ty))
    }

    pub fn map(&mut self, src: ExprId, kernel: KernelRef, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::Map { src, kernel, ty })
    }

    pub fn zip(&mut self, srcs: Vec<ExprId>, kernel: KernelRef, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::Zip { srcs, kernel, ty })
    }

    pub fn zip_sig(
        &mut self,
        field: ExprId,
        sigs: Vec<ExprId>,
        kernel: KernelRef,
        ty: CanonType,
    ) -> ExprId {
        self.expr(ValueExpr::ZipSig {
            field,
            sigs,
            kernel,
            ty,
        })
    }

    pub fn construct(&mut self, parts: Vec<ExprId>, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::Construct { parts, ty })
    }

    pub fn broadcast(&mut self, sig: ExprId, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::Broadcast { sig, ty })
    }

    pub fn state_read(&mut self, state: StateIdx, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::StateRead { state, ty })
    }

    pub fn event_read(&mut self, event: EventId, ty: CanonType) -> ExprId {
        self.expr(ValueExpr::EventRead { event, ty })
    }

    // Reserve `stride` consecutive cells for a value of this type.
    pub fn alloc_slot(&mut self, ty: CanonType) -> Result<Slot, String> {
        let stride = ty
            .stride()
            .map_err(|e| format!("slot allocation: {}", e))?;
        if stride == 0 {
            return Err(String::from("slot allocation: opaque payload has no cells"));
        }
        let slot = Slot(self.next_cell);
        self.next_cell += stride as u32;
        self.slots.push(SlotInfo {
            slot,
            ty,
            stride,
            block: self.cur_block,
        });
        Ok(slot)
    }

    // State slots are identified by their stable key; re-allocating
    // the same key yields the same index so the read and write halves
    // of a state block meet in one slot.
    pub fn alloc_state(
        &mut self,
        key: StateKey,
        init: ConstVal,
        ty: CanonType,
    ) -> Result<StateIdx, String> {
        if let Some(idx) = self.state_index.get(&key) {
            let existing = &self.state[idx.0 as usize];
            if existing.ty != ty {
                return Err(format!(
                    "state {}/{} re-declared with a different type",
                    key.instance, key.role
                ));
            }
            return Ok(*idx);
        }
        let idx = StateIdx(self.state.len() as u32);
        self.state.push(StateDecl {
            key: key.clone(),
            init,
            ty,
        });
        self.state_index.insert(key, idx);
        Ok(idx)
    }

    pub fn create_instance(&mut self, decl: InstanceDecl) {
        self.instances.push(decl);
    }

    pub fn set_instance_shape(&mut self, id: InstanceId, shape: ExprId) -> Result<(), String> {
        for decl in self.instances.iter_mut() {
            if decl.id == id {
                decl.shape = Some(shape);
                return Ok(());
            }
        }
        Err(format!("unknown instance {:?}", id))
    }

    pub fn instance(&self, id: InstanceId) -> Option<&InstanceDecl> {
        self.instances.iter().find(|d| d.id == id)
    }

    pub fn event_channel(&mut self, channel: &str) -> EventId {
        if let Some(i) = self.events.iter().position(|c| c == channel) {
            return EventId(i as u32);
        }
        self.events.push(String::from(channel));
        EventId((self.events.len() - 1) as u32)
    }

    // Dynamic topology registry: one entry per distinct name.
    pub fn register_topology(&mut self, topo: PathTopology) -> TopologyId {
        if let Some(id) = self.topology_index.get(&topo.name) {
            return *id;
        }
        let id = TopologyId(self.topologies.len() as u32);
        self.topology_index.insert(topo.name.clone(), id);
        self.topologies.push(topo);
        id
    }

    pub fn topology(&self, id: TopologyId) -> Option<&PathTopology> {
        self.topologies.get(id.0 as usize)
    }

    // Imperative step emitters. The scheduler orders these alongside
    // the materializations it derives itself.

    pub fn step_eval(&mut self, expr: ExprId, slot: Slot) {
        self.push_step(Step::Eval { expr, slot });
    }

    pub fn step_slot_write_strided(&mut self, slot: Slot, parts: Vec<ExprId>) {
        self.push_step(Step::WriteStrided { slot, parts });
    }

    pub fn step_state_write(&mut self, state: StateIdx, expr: ExprId) {
        self.push_step(Step::StateWrite { state, expr });
    }

    fn push_step(&mut self, step: Step) {
        self.steps.push(EmittedStep {
            step,
            block: self.cur_block,
        });
    }

    pub fn add_render_global(&mut self, global: RenderGlobal) {
        self.render.push((global, self.cur_block));
    }

    pub fn has_camera(&self) -> bool {
        self.render
            .iter()
            .any(|(g, _)| matches!(g, RenderGlobal::Camera { .. }))
    }

    pub fn finish(self) -> IrParts {
        IrParts {
            exprs: self.exprs,
            expr_block: self.expr_block,
            slots: self.slots,
            next_cell: self.next_cell,
            state: self.state,
            instances: self.instances,
            events: self.events,
            steps: self.steps,
            render: self.render,
            topologies: self.topologies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Unit;

    fn float() -> CanonType {
        CanonType::new(Payload::Float)
    }

    #[test]
    fn test_leaf_dedup() {
        let mut ir = IrBuilder::new();
        let a = ir.const_f64(1.0, float());
        let b = ir.const_f64(1.0, float());
        let c = ir.const_f64(2.0, float());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ir.expr_count(), 2);
    }

    #[test]
    fn test_interior_not_deduped() {
        let mut ir = IrBuilder::new();
        let a = ir.const_f64(1.0, float());
        let m1 = ir.map(a, KernelRef::Op(OpCode::Sin), float());
        let m2 = ir.map(a, KernelRef::Op(OpCode::Sin), float());
        assert_ne!(m1, m2);
    }

    #[test]
    fn test_slot_strides() {
        let mut ir = IrBuilder::new();
        let s1 = ir.alloc_slot(CanonType::new(Payload::Vec2)).unwrap();
        let s2 = ir.alloc_slot(float()).unwrap();
        assert_eq!(s1, Slot(0));
        assert_eq!(s2, Slot(2));
        assert!(ir.alloc_slot(CanonType::new(Payload::Shape)).is_err());
    }

    #[test]
    fn test_state_dedup() {
        let mut ir = IrBuilder::new();
        let key = StateKey::new("hold", "sample");
        let a = ir
            .alloc_state(key.clone(), ConstVal::Float(0.0), float())
            .unwrap();
        let b = ir
            .alloc_state(key.clone(), ConstVal::Float(0.0), float())
            .unwrap();
        assert_eq!(a, b);
        assert!(ir
            .alloc_state(key, ConstVal::Float(0.0), CanonType::new(Payload::Int))
            .is_err());
    }

    #[test]
    fn test_event_channel_dedup() {
        let mut ir = IrBuilder::new();
        let a = ir.event_channel("pads.kick");
        let b = ir.event_channel("pads.kick");
        let c = ir.event_channel("pads.snare");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_kernel_catalog_arities() {
        assert_eq!(OpCode::Sin.arity(), 1);
        assert_eq!(OpCode::Lerp.arity(), 3);
        assert_eq!(OpCode::Add.arity(), 2);
        assert_eq!(KernelName::PolygonVertex.arity(), 3);
        assert_eq!(KernelName::HueFromPhase.out_payload(), Payload::Color);
        assert_eq!(KernelRef::Op(OpCode::Gt).arity(), 2);
    }

    #[test]
    fn test_children_order() {
        let mut ir = IrBuilder::new();
        let a = ir.const_f64(1.0, float());
        let b = ir.const_f64(2.0, float());
        let z = ir.zip(vec![a, b], KernelRef::Op(OpCode::Add), float());
        assert_eq!(ir.expr_at(z).children(), vec![a, b]);

        let zs = ir.zip_sig(a, vec![b], KernelRef::Named(KernelName::FieldMod), float());
        assert_eq!(ir.expr_at(zs).children(), vec![a, b]);
    }

    #[test]
    fn test_intrinsic_dedup_keeps_unit() {
        let mut ir = IrBuilder::new();
        let secs = CanonType::with_unit(Payload::Float, Unit::Time(crate::types::TimeUnit::Seconds));
        let t1 = ir.intrinsic(Intrinsic::Time, secs);
        let t2 = ir.intrinsic(Intrinsic::Time, secs);
        assert_eq!(t1, t2);
    }
}
