// The compiled program: what the tick runtime consumes.
//
// The layout is versioned; a consumer seeing an unknown version or an
// unknown step kind must refuse to run the program rather than guess.

use serde::{Deserialize, Serialize};

use crate::debug::DebugIndex;
use crate::ir::{ConstVal, InstanceDecl, RenderGlobal, StateKey, Step, ValueExpr};
use crate::shapes::PathTopology;
use crate::types::{CanonType, Storage};

pub const PROGRAM_VERSION: u32 = 1;

// Byte layout of one live slot. `slot` is the base cell; `offset` is
// the byte offset of that cell in the backing store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotMeta {
    pub slot: u32,
    pub ty: CanonType,
    pub storage: Storage,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    pub step: Step,
    pub block: u32,
    pub phase: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMeta {
    pub key: StateKey,
    pub init: ConstVal,
    pub ty: CanonType,
}

// The program's data section: slots whose value never changes are
// written once at load time instead of every tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstWrite {
    pub slot: u32,
    pub value: ConstVal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub version: u32,
    pub exprs: Vec<ValueExpr>,
    pub slot_meta: Vec<SlotMeta>,
    // Steps in execution order; everything before phase1_end reads
    // state, everything after may write it.
    pub steps: Vec<StepMeta>,
    pub phase1_end: usize,
    pub const_writes: Vec<ConstWrite>,
    pub state_slots: Vec<StateMeta>,
    pub render_globals: Vec<RenderGlobal>,
    pub instances: Vec<InstanceDecl>,
    pub events: Vec<String>,
    pub topologies: Vec<PathTopology>,
    pub debug: Option<DebugIndex>,
}

impl CompiledProgram {
    pub fn slot_meta_for(&self, slot: u32) -> Option<&SlotMeta> {
        self.slot_meta.iter().find(|m| m.slot == slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ExprId, Slot};
    use crate::types::Payload;

    #[test]
    fn test_wire_roundtrip() {
        let program = CompiledProgram {
            version: PROGRAM_VERSION,
            exprs: vec![ValueExpr::Const(
                ConstVal::Float(1.5),
                CanonType::new(Payload::Float),
            )],
            slot_meta: vec![SlotMeta {
                slot: 0,
                ty: CanonType::new(Payload::Float),
                storage: Storage::F32,
                offset: 0,
            }],
            steps: vec![StepMeta {
                step: Step::Eval {
                    expr: ExprId(0),
                    slot: Slot(0),
                },
                block: 0,
                phase: 2,
            }],
            phase1_end: 0,
            const_writes: Vec::new(),
            state_slots: Vec::new(),
            render_globals: Vec::new(),
            instances: Vec::new(),
            events: Vec::new(),
            topologies: Vec::new(),
            debug: None,
        };

        let json = serde_json::to_string(&program).unwrap();
        let back: CompiledProgram = serde_json::from_str(&json).unwrap();
        assert_eq!(back, program);
        assert_eq!(back.version, PROGRAM_VERSION);
    }
}
