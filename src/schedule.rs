// Slot allocation and step scheduling.
//
// Lowering produces an expression DAG plus a handful of explicit
// steps; this pass decides what is materialized where, and in which
// order the runtime executes it.
//
// Materialization rules, applied in deterministic order:
//   - anything a block slotted or forced stays materialized;
//   - an output port consumed exactly once by a pure expression is
//     fused away (no slot, no step), everything else gets a slot;
//   - interior expressions shared by two or more consumers are
//     materialized once (CSE);
//   - state reads are always materialized, and their eval steps form
//     phase 1 so every other step sees last tick's value by slot.
//
// Step order is a topological sort over slot reads and writes; the
// state-write -> state-read dependency is deliberately absent (that
// edge crosses ticks). Ties break by block index, then emission
// order, so equal patches schedule identically.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::diag::{codes, DiagKind, Diagnostic};
use crate::ir::{ExprId, IrParts, Slot, SlotInfo, Step, ValueExpr};
use crate::lower::LowerResult;
use crate::passes::Graph;
use crate::program::{ConstWrite, SlotMeta, StepMeta};
use crate::registry::{Capability, Purity, Registry};
use crate::trace;
use crate::types::{CanonType, Payload, Term};

pub struct ScheduleOut {
    pub steps: Vec<StepMeta>,
    pub phase1_end: usize,
    pub const_writes: Vec<ConstWrite>,
    pub slot_meta: Vec<SlotMeta>,
    pub port_slot: HashMap<(String, String), Slot>,
    pub slot_block: Vec<(u32, u32)>,
}

fn sched_error(msg: impl Into<String>) -> Diagnostic {
    Diagnostic::new(DiagKind::Scheduling, codes::CYCLE_DETECTED, msg.into())
}

fn alloc(parts: &mut IrParts, ty: CanonType, block: u32) -> Option<Slot> {
    let stride = ty.stride().ok()?;
    if stride == 0 {
        return None;
    }
    let slot = Slot(parts.next_cell);
    parts.next_cell += stride as u32;
    parts.slots.push(SlotInfo {
        slot,
        ty,
        stride,
        block,
    });
    Some(slot)
}

fn is_shape(ty: &CanonType) -> bool {
    ty.payload == Term::Fixed(Payload::Shape)
}

pub fn schedule(
    graph: &Graph,
    registry: &Registry,
    parts: &mut IrParts,
    lowered: &LowerResult,
) -> Result<ScheduleOut, Diagnostic> {
    // Slots that already exist: block requests (riding on ValueRefs)
    // and imperative eval steps.
    let mut expr_slot: HashMap<ExprId, Slot> = HashMap::new();
    for emitted in &parts.steps {
        if let Step::Eval { expr, slot } = &emitted.step {
            expr_slot.entry(*expr).or_insert(*slot);
        }
    }
    for (_, _, value) in &lowered.ordered_outputs {
        if let Some(slot) = value.slot() {
            expr_slot.entry(value.id()).or_insert(slot);
        }
    }

    // Live expressions: everything reachable from an observable root.
    let mut roots: Vec<ExprId> = Vec::new();
    for (_, _, value) in &lowered.ordered_outputs {
        roots.push(value.id());
    }
    for emitted in &parts.steps {
        match &emitted.step {
            Step::Eval { expr, .. } => roots.push(*expr),
            Step::WriteStrided { parts: ps, .. } => roots.extend(ps.iter().cloned()),
            Step::StateWrite { expr, .. } => roots.push(*expr),
        }
    }
    roots.extend(lowered.forced.iter().cloned());

    let mut live: HashSet<ExprId> = HashSet::new();
    let mut stack: Vec<ExprId> = roots.clone();
    while let Some(e) = stack.pop() {
        if live.insert(e) {
            stack.extend(parts.exprs[e.0 as usize].children());
        }
    }

    let mut parent_count: HashMap<ExprId, usize> = HashMap::new();
    for e in &live {
        for child in parts.exprs[e.0 as usize].children() {
            *parent_count.entry(child).or_insert(0) += 1;
        }
    }
    let parents = |e: ExprId| parent_count.get(&e).cloned().unwrap_or(0);

    let forced: HashSet<ExprId> = lowered.forced.iter().cloned().collect();

    // Decide materialization. Output ports first, in block order.
    for (block_id, _, value) in &lowered.ordered_outputs {
        let e = value.id();
        let ty = value.ty();
        if is_shape(&ty) || expr_slot.contains_key(&e) {
            continue;
        }
        let expr = &parts.exprs[e.0 as usize];
        let state_read = matches!(expr, ValueExpr::StateRead { .. });
        let block_veto = graph
            .block(block_id)
            .and_then(|b| registry.get(&b.block_type))
            .map_or(false, |d| {
                d.lowering_purity == Some(Purity::Impure)
                    || matches!(
                        d.capability,
                        Capability::Io | Capability::State | Capability::Render
                    )
            });
        let fusable =
            !state_read && !block_veto && !forced.contains(&e) && parents(e) == 1;
        if fusable {
            continue;
        }
        let block = parts.expr_block[e.0 as usize];
        if let Some(slot) = alloc(parts, ty, block) {
            expr_slot.insert(e, slot);
        }
    }

    // Forced interior expressions.
    for e in &lowered.forced {
        if expr_slot.contains_key(e) {
            continue;
        }
        let ty = parts.exprs[e.0 as usize].ty();
        if is_shape(&ty) {
            continue;
        }
        let block = parts.expr_block[e.0 as usize];
        if let Some(slot) = alloc(parts, ty, block) {
            expr_slot.insert(*e, slot);
        }
    }

    // Shared interiors (CSE) and stray state reads, in id order.
    let mut interior: Vec<ExprId> = live.iter().cloned().collect();
    interior.sort();
    for e in interior {
        if expr_slot.contains_key(&e) {
            continue;
        }
        let expr = &parts.exprs[e.0 as usize];
        let ty = expr.ty();
        if is_shape(&ty) {
            continue;
        }
        let state_read = matches!(expr, ValueExpr::StateRead { .. });
        if parents(e) >= 2 || state_read {
            let block = parts.expr_block[e.0 as usize];
            if let Some(slot) = alloc(parts, ty, block) {
                expr_slot.insert(e, slot);
            }
        }
    }

    // Assemble the step list: imperative steps as emitted, then one
    // eval per materialized expression that lacks one.
    struct Pending {
        step: Step,
        block: u32,
        seq: u32,
        phase: u8,
    }
    let mut pending: Vec<Pending> = Vec::new();
    let mut seq = 0u32;
    let mut has_eval: HashSet<ExprId> = HashSet::new();
    for emitted in &parts.steps {
        if let Step::Eval { expr, .. } = &emitted.step {
            has_eval.insert(*expr);
        }
        pending.push(Pending {
            step: emitted.step.clone(),
            block: emitted.block,
            seq,
            phase: phase_of(&emitted.step, &parts.exprs),
        });
        seq += 1;
    }
    // Constant-rooted slots go to the data section, everything else
    // becomes a per-tick eval.
    let mut const_writes: Vec<ConstWrite> = Vec::new();
    let mut slotted: Vec<(ExprId, Slot)> = expr_slot.iter().map(|(e, s)| (*e, *s)).collect();
    slotted.sort();
    for (e, slot) in slotted {
        if has_eval.contains(&e) {
            continue;
        }
        if let ValueExpr::Const(value, _) = &parts.exprs[e.0 as usize] {
            const_writes.push(ConstWrite {
                slot: slot.0,
                value: value.clone(),
            });
            continue;
        }
        let step = Step::Eval { expr: e, slot };
        pending.push(Pending {
            phase: phase_of(&step, &parts.exprs),
            block: parts.expr_block[e.0 as usize],
            seq,
            step,
        });
        seq += 1;
    }

    // Dependencies over slot cells.
    let mut writer_of: HashMap<u32, usize> = HashMap::new();
    for (i, p) in pending.iter().enumerate() {
        match &p.step {
            Step::Eval { slot, expr } => {
                let stride = parts.exprs[expr.0 as usize]
                    .ty()
                    .stride()
                    .unwrap_or(1);
                for c in 0..stride as u32 {
                    writer_of.insert(slot.0 + c, i);
                }
            }
            Step::WriteStrided { slot, parts: ps } => {
                for c in 0..ps.len() as u32 {
                    writer_of.insert(slot.0 + c, i);
                }
            }
            Step::StateWrite { .. } => {}
        }
    }

    let reads_of = |root_exprs: Vec<ExprId>, own: Option<ExprId>| -> HashSet<u32> {
        let mut cells = HashSet::new();
        let mut stack = root_exprs;
        let mut seen = HashSet::new();
        while let Some(e) = stack.pop() {
            if !seen.insert(e) {
                continue;
            }
            if Some(e) != own {
                if let Some(slot) = expr_slot.get(&e) {
                    cells.insert(slot.0);
                    continue;
                }
            }
            if let ValueExpr::SlotRead { slot, .. } = &parts.exprs[e.0 as usize] {
                cells.insert(slot.0);
            }
            stack.extend(parts.exprs[e.0 as usize].children());
        }
        cells
    };

    let mut deps: Vec<HashSet<usize>> = Vec::with_capacity(pending.len());
    for p in &pending {
        let cells = match &p.step {
            Step::Eval { expr, .. } => reads_of(vec![*expr], Some(*expr)),
            Step::WriteStrided { parts: ps, .. } => reads_of(ps.clone(), None),
            Step::StateWrite { expr, .. } => reads_of(vec![*expr], None),
        };
        let mut d = HashSet::new();
        for cell in cells {
            if let Some(w) = writer_of.get(&cell) {
                d.insert(*w);
            }
        }
        deps.push(d);
    }

    // Kahn, smallest (phase, block, seq) first.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); pending.len()];
    let mut missing: Vec<usize> = vec![0; pending.len()];
    for (i, d) in deps.iter().enumerate() {
        let d: Vec<usize> = d.iter().cloned().filter(|w| *w != i).collect();
        missing[i] = d.len();
        for w in d {
            dependents[w].push(i);
        }
    }
    let mut heap: BinaryHeap<Reverse<(u8, u32, u32, usize)>> = BinaryHeap::new();
    for (i, p) in pending.iter().enumerate() {
        if missing[i] == 0 {
            heap.push(Reverse((p.phase, p.block, p.seq, i)));
        }
    }

    let mut ordered: Vec<usize> = Vec::with_capacity(pending.len());
    while let Some(Reverse((_, _, _, i))) = heap.pop() {
        ordered.push(i);
        for next in &dependents[i] {
            missing[*next] -= 1;
            if missing[*next] == 0 {
                let p = &pending[*next];
                heap.push(Reverse((p.phase, p.block, p.seq, *next)));
            }
        }
    }
    if ordered.len() != pending.len() {
        return Err(sched_error("step dependencies form a cycle"));
    }

    let steps: Vec<StepMeta> = ordered
        .iter()
        .map(|i| {
            let p = &pending[*i];
            StepMeta {
                step: p.step.clone(),
                block: p.block,
                phase: p.phase,
            }
        })
        .collect();
    let phase1_end = steps.iter().take_while(|s| s.phase == 1).count();

    let mut slot_meta: Vec<SlotMeta> = parts
        .slots
        .iter()
        .map(|info| SlotMeta {
            slot: info.slot.0,
            ty: info.ty,
            storage: info
                .ty
                .payload
                .fixed()
                .expect("resolved payload")
                .storage(),
            offset: info.slot.0 * 4,
        })
        .collect();
    slot_meta.sort_by_key(|m| m.slot);

    let mut port_slot: HashMap<(String, String), Slot> = HashMap::new();
    for (block, port, value) in &lowered.ordered_outputs {
        if let Some(slot) = expr_slot.get(&value.id()) {
            port_slot.insert((block.clone(), port.clone()), *slot);
        }
    }

    let slot_block: Vec<(u32, u32)> = parts
        .slots
        .iter()
        .map(|info| (info.slot.0, info.block))
        .collect();

    trace!(
        "scheduled {} steps over {} slots ({} in phase 1)",
        steps.len(),
        slot_meta.len(),
        phase1_end
    );
    Ok(ScheduleOut {
        steps,
        phase1_end,
        const_writes,
        slot_meta,
        port_slot,
        slot_block,
    })
}

fn phase_of(step: &Step, exprs: &[ValueExpr]) -> u8 {
    match step {
        Step::Eval { expr, .. } => match &exprs[expr.0 as usize] {
            ValueExpr::StateRead { .. } => 1,
            _ => 2,
        },
        _ => 2,
    }
}
