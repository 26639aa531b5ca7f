// The lowering driver.
//
// Blocks are lowered in index order. Each block sees its resolved
// input values as ValueRefs, returns a ValueRef per output port, and
// may request effects: slot requests (the driver allocates and
// back-fills, the block never numbers slots itself) and eval requests
// (force materialization for sinks). Blocks may also use the
// builder's imperative emitters; the scheduler treats both the same.
//
// State blocks lower in two halves. The read half runs at the block's
// position with no inputs resolved (feedback edges may point at
// blocks that lower later); the finish half runs after every block
// has lowered and emits the state writes from real inputs.

use std::collections::HashMap;

use crate::diag::{codes, DiagKind, Diagnostic};
use crate::ir::{ExprId, InstanceDecl, IrBuilder, Slot};
use crate::passes::Graph;
use crate::registry::{cfg_f64, cfg_f64_or, cfg_str, cfg_usize, Capability, Config, Registry};
use crate::typechecker::TypeMap;
use crate::trace;
use crate::types::{CanonType, Domain, InstanceId};

// Common state of both ValueRef constructors.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueParts {
    pub id: ExprId,
    pub slot: Option<Slot>,
    pub ty: CanonType,
    pub stride: usize,
}

// A lowered value: exactly signal or field, dispatched by matching.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueRef {
    Signal(ValueParts),
    Field(ValueParts),
}

impl ValueRef {
    pub fn new(id: ExprId, ty: CanonType) -> Result<ValueRef, String> {
        let stride = ty.stride().map_err(|e| format!("{}", e))?;
        let parts = ValueParts {
            id,
            slot: None,
            ty,
            stride,
        };
        Ok(if ty.is_field() {
            ValueRef::Field(parts)
        } else {
            ValueRef::Signal(parts)
        })
    }

    pub fn parts(&self) -> &ValueParts {
        match self {
            ValueRef::Signal(p) | ValueRef::Field(p) => p,
        }
    }

    fn parts_mut(&mut self) -> &mut ValueParts {
        match self {
            ValueRef::Signal(p) | ValueRef::Field(p) => p,
        }
    }

    pub fn id(&self) -> ExprId {
        self.parts().id
    }

    pub fn ty(&self) -> CanonType {
        self.parts().ty
    }

    pub fn slot(&self) -> Option<Slot> {
        self.parts().slot
    }

    pub fn stride(&self) -> usize {
        self.parts().stride
    }

    pub fn is_field(&self) -> bool {
        match self {
            ValueRef::Field(_) => true,
            ValueRef::Signal(_) => false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum InputVal {
    Missing,
    One(ValueRef),
    Many(Vec<ValueRef>),
}

// Declarative side-effects of one block's lowering.
#[derive(Clone, Debug, Default)]
pub struct Effects {
    pub slot_requests: Vec<&'static str>,
    pub eval_requests: Vec<ExprId>,
}

#[derive(Clone, Debug)]
pub struct Lowered {
    pub outputs: Vec<(&'static str, ValueRef)>,
    pub effects: Effects,
}

impl Lowered {
    pub fn new() -> Lowered {
        Lowered {
            outputs: Vec::new(),
            effects: Effects::default(),
        }
    }

    pub fn out(mut self, port: &'static str, value: ValueRef) -> Lowered {
        self.outputs.push((port, value));
        self
    }

    pub fn slot_request(mut self, port: &'static str) -> Lowered {
        self.effects.slot_requests.push(port);
        self
    }

    pub fn eval(mut self, expr: ExprId) -> Lowered {
        self.effects.eval_requests.push(expr);
        self
    }
}

// Everything one block's lower (or finish) sees.
pub struct LowerCtx<'a> {
    pub ir: &'a mut IrBuilder,
    pub block_idx: u32,
    pub block_id: &'a str,
    pub block_type: &'a str,
    pub config: &'a Config,
    inputs: HashMap<String, InputVal>,
    in_types: HashMap<String, CanonType>,
    out_types: HashMap<String, CanonType>,
    inferred_instance: Option<(InstanceId, Domain, usize)>,
}

pub type FinishCtx<'a> = LowerCtx<'a>;

impl<'a> LowerCtx<'a> {
    pub fn input(&self, port: &str) -> Option<&ValueRef> {
        match self.inputs.get(port) {
            Some(InputVal::One(v)) => Some(v),
            _ => None,
        }
    }

    pub fn require_input(&self, port: &str) -> Result<&ValueRef, String> {
        self.input(port)
            .ok_or_else(|| format!("input {} is not connected", port))
    }

    pub fn vararg(&self, port: &str) -> &[ValueRef] {
        match self.inputs.get(port) {
            Some(InputVal::Many(v)) => v,
            _ => &[],
        }
    }

    pub fn in_type(&self, port: &str) -> Option<CanonType> {
        self.in_types.get(port).cloned()
    }

    pub fn out_type(&self, port: &str) -> Result<CanonType, String> {
        self.out_types
            .get(port)
            .cloned()
            .ok_or_else(|| format!("no output named {}", port))
    }

    // The instance this block's fields live over, when it has one.
    pub fn instance(&self) -> Option<(InstanceId, Domain, usize)> {
        self.inferred_instance
    }

    // Stable identity used for state keys: the block's id survives
    // recompiles, the block index does not.
    pub fn instance_key(&self) -> &str {
        self.block_id
    }

    pub fn cfg_f64(&self, key: &str) -> Option<f64> {
        cfg_f64(self.config, key)
    }

    pub fn cfg_f64_or(&self, key: &str, fallback: f64) -> f64 {
        cfg_f64_or(self.config, key, fallback)
    }

    pub fn cfg_usize(&self, key: &str) -> Option<usize> {
        cfg_usize(self.config, key)
    }

    pub fn cfg_str(&self, key: &str) -> Option<&str> {
        cfg_str(self.config, key)
    }
}

// Driver output consumed by the scheduler and the debug indexer.
pub struct LowerResult {
    pub outputs: HashMap<(String, String), ValueRef>,
    // (block id, port, value) in block-index then declaration order.
    pub ordered_outputs: Vec<(String, String, ValueRef)>,
    pub forced: Vec<ExprId>,
}

fn fail(block: &str, msg: impl std::fmt::Display) -> Diagnostic {
    Diagnostic::new(
        DiagKind::Lowering,
        codes::LOWERING_FAILED,
        format!("{}", msg),
    )
    .at_block(String::from(block))
}

pub fn lower_graph(
    graph: &Graph,
    registry: &Registry,
    types: &TypeMap,
    ir: &mut IrBuilder,
) -> Result<LowerResult, Diagnostic> {
    for plan in &types.instances {
        ir.create_instance(InstanceDecl {
            id: plan.id,
            key: plan.key.clone(),
            domain: plan.domain,
            count: plan.count,
            shape: None,
        });
    }

    let mut result = LowerResult {
        outputs: HashMap::new(),
        ordered_outputs: Vec::new(),
        forced: Vec::new(),
    };

    for block_id in &graph.order {
        lower_block(graph, registry, types, ir, block_id, &mut result)?;
    }

    // Second half of the state split: every producer exists now.
    for block_id in &graph.order {
        let block = graph.block(block_id).expect("indexed block");
        let def = registry.require(&block.block_type)?;
        if def.capability != Capability::State {
            continue;
        }
        let finish = def.finish.expect("validated state block");
        let block_idx = graph.index_of(block_id).expect("indexed block");
        ir.set_current_block(block_idx);
        let inputs = resolve_inputs(graph, registry, types, ir, block_id, &result, false)
            .map_err(|msg| fail(block_id, msg))?;
        let mut ctx = LowerCtx {
            ir,
            block_idx,
            block_id,
            block_type: &block.block_type,
            config: &block.config,
            inputs,
            in_types: port_types(types, block_id, true),
            out_types: port_types(types, block_id, false),
            inferred_instance: inferred_instance(types, block_id),
        };
        finish(&mut ctx).map_err(|msg| fail(block_id, format!("{}: {}", block.block_type, msg)))?;
    }

    trace!("lowered {} blocks", graph.order.len());
    Ok(result)
}

fn lower_block(
    graph: &Graph,
    registry: &Registry,
    types: &TypeMap,
    ir: &mut IrBuilder,
    block_id: &str,
    result: &mut LowerResult,
) -> Result<(), Diagnostic> {
    let block = graph.block(block_id).expect("indexed block");
    let def = registry.require(&block.block_type)?;
    let block_idx = graph.index_of(block_id).expect("indexed block");
    ir.set_current_block(block_idx);

    // The read half of a state block must not look at inputs; they
    // may not exist yet.
    let defer_inputs = def.capability == Capability::State;
    let inputs = resolve_inputs(graph, registry, types, ir, block_id, result, defer_inputs)
        .map_err(|msg| fail(block_id, msg))?;

    let mut ctx = LowerCtx {
        ir,
        block_idx,
        block_id,
        block_type: &block.block_type,
        config: &block.config,
        inputs,
        in_types: port_types(types, block_id, true),
        out_types: port_types(types, block_id, false),
        inferred_instance: inferred_instance(types, block_id),
    };

    let lowered = (def.lower)(&mut ctx)
        .map_err(|msg| fail(block_id, format!("{}: {}", block.block_type, msg)))?;

    let mut outputs: HashMap<&str, ValueRef> = HashMap::new();
    for (port, value) in lowered.outputs {
        if def.get_output(port).is_none() {
            return Err(fail(
                block_id,
                format!("{} produced undeclared output {}", block.block_type, port),
            ));
        }
        outputs.insert(port, value);
    }

    // Back-fill requested slots before anything downstream copies the
    // ValueRef.
    for port in lowered.effects.slot_requests {
        let ty = types
            .out_type(block_id, port)
            .ok_or_else(|| fail(block_id, format!("slot request for unknown port {}", port)))?;
        let slot = ir
            .alloc_slot(ty)
            .map_err(|msg| fail(block_id, msg))?;
        match outputs.get_mut(port) {
            Some(value) => value.parts_mut().slot = Some(slot),
            None => {
                return Err(fail(
                    block_id,
                    format!("slot request for output {} that was not produced", port),
                ))
            }
        }
    }
    result.forced.extend(lowered.effects.eval_requests);

    // Every declared output must have been produced.
    for (port, _) in &def.outputs {
        let value = outputs.remove(*port).ok_or_else(|| {
            fail(
                block_id,
                format!("{} did not produce output {}", block.block_type, port),
            )
        })?;
        result
            .outputs
            .insert((String::from(block_id), String::from(*port)), value.clone());
        result
            .ordered_outputs
            .push((String::from(block_id), String::from(*port), value));
    }

    Ok(())
}

fn port_types(types: &TypeMap, block_id: &str, inputs: bool) -> HashMap<String, CanonType> {
    types
        .ports()
        .filter(|(key, _)| {
            key.block == block_id
                && (key.dir == crate::typechecker::Dir::In) == inputs
        })
        .map(|(key, ty)| (key.port.clone(), *ty))
        .collect()
}

fn inferred_instance(types: &TypeMap, block_id: &str) -> Option<(InstanceId, Domain, usize)> {
    let (id, domain) = types.block_instance.get(block_id)?.clone();
    let count = types
        .instances
        .iter()
        .find(|p| p.id == id)
        .map(|p| p.count)?;
    Some((id, domain, count))
}

fn resolve_inputs(
    graph: &Graph,
    registry: &Registry,
    types: &TypeMap,
    ir: &mut IrBuilder,
    block_id: &str,
    result: &LowerResult,
    deferred: bool,
) -> Result<HashMap<String, InputVal>, String> {
    let block = graph.block(block_id).expect("indexed block");
    let def = registry
        .get(&block.block_type)
        .ok_or_else(|| format!("unknown block type {}", block.block_type))?;
    let mut inputs = HashMap::new();

    for (port, input_def) in &def.inputs {
        if deferred {
            inputs.insert(String::from(*port), InputVal::Missing);
            continue;
        }
        if input_def.is_vararg() {
            let mut refs = Vec::new();
            if let Some(va) = graph
                .varargs
                .iter()
                .find(|v| v.block == block_id && v.port == *port)
            {
                for conn in &va.connections {
                    let value = result
                        .outputs
                        .get(&(conn.source.block.clone(), conn.source.port.clone()))
                        .ok_or_else(|| format!("vararg source {} not lowered", conn.source))?;
                    refs.push(value.clone());
                }
            }
            inputs.insert(String::from(*port), InputVal::Many(refs));
            continue;
        }

        match graph.edge_into(block_id, port) {
            Some(edge) => {
                let src = result
                    .outputs
                    .get(&(edge.from.block.clone(), edge.from.port.clone()))
                    .ok_or_else(|| format!("source {} not lowered", edge.from))?;
                let value = if types.broadcast_edges.contains(&edge.id) {
                    // The solver marked this edge: lift the signal
                    // into the consumer's field extent.
                    let ty = types
                        .in_type(block_id, port)
                        .ok_or_else(|| format!("no resolved type for {}:{}", block_id, port))?;
                    let lifted = ir.broadcast(src.id(), ty);
                    ValueRef::new(lifted, ty)?
                } else {
                    src.clone()
                };
                inputs.insert(String::from(*port), InputVal::One(value));
            }
            None => {
                inputs.insert(String::from(*port), InputVal::Missing);
            }
        }
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ExprId;
    use crate::types::{CanonType, Domain, InstanceId, Payload, Unit};

    #[test]
    fn test_value_ref_picks_constructor() {
        let sig = ValueRef::new(ExprId(0), CanonType::new(Payload::Vec2)).unwrap();
        assert!(!sig.is_field());
        assert_eq!(sig.stride(), 2);
        assert_eq!(sig.slot(), None);

        let field_ty =
            CanonType::field(Payload::Float, Unit::None, InstanceId(3), Domain::Default);
        let field = ValueRef::new(ExprId(1), field_ty).unwrap();
        assert!(field.is_field());
        assert_eq!(field.ty().instance(), Some((InstanceId(3), Domain::Default)));
    }

    #[test]
    fn test_lowered_builder_accumulates_effects() {
        let ty = CanonType::new(Payload::Float);
        let lowered = Lowered::new()
            .out("out", ValueRef::new(ExprId(0), ty).unwrap())
            .slot_request("out")
            .eval(ExprId(0));
        assert_eq!(lowered.outputs.len(), 1);
        assert_eq!(lowered.effects.slot_requests, vec!["out"]);
        assert_eq!(lowered.effects.eval_requests, vec![ExprId(0)]);
    }
}
