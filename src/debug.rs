// Debug index and the edge-mapping service.
//
// The index is recorded at compile time and rides inside the program;
// the mapping service joins a patch against a compiled program at
// runtime so the editor can show live values per wire. The service
// never fails as a whole: every edge either maps to a slot or comes
// back with a structured reason why not.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ir::Slot;
use crate::lower::LowerResult;
use crate::passes::{BlockOrigin, Graph};
use crate::patch::Patch;
use crate::program::CompiledProgram;
use crate::schedule::ScheduleOut;
use crate::types::{Cardinality, CanonType};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDir {
    In,
    Out,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDomain {
    Signal,
    Field,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortRole {
    UserWire,
    Adapter,
    Default,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortEntry {
    // Canonical "blockId:portName" address.
    pub port: String,
    pub block: String,
    pub port_name: String,
    pub dir: PortDir,
    pub domain: PortDomain,
    pub role: PortRole,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugIndex {
    pub block_map: Vec<(u32, String)>,
    pub ports: Vec<PortEntry>,
    pub slot_to_port: Vec<(u32, String)>,
    pub step_to_block: Vec<u32>,
    pub slot_to_block: Vec<(u32, u32)>,
}

fn role_of(origin: BlockOrigin) -> PortRole {
    match origin {
        BlockOrigin::Adapter => PortRole::Adapter,
        BlockOrigin::Default => PortRole::Default,
        BlockOrigin::User | BlockOrigin::MacroInner => PortRole::UserWire,
    }
}

// Record the mapping surface alongside scheduling.
pub fn build_index(graph: &Graph, lowered: &LowerResult, sched: &ScheduleOut) -> DebugIndex {
    let mut index = DebugIndex::default();

    for (i, id) in graph.order.iter().enumerate() {
        index.block_map.push((i as u32, id.clone()));
    }

    for (block, port, value) in &lowered.ordered_outputs {
        let addr = format!("{}:{}", block, port);
        index.ports.push(PortEntry {
            port: addr.clone(),
            block: block.clone(),
            port_name: port.clone(),
            dir: PortDir::Out,
            domain: if value.is_field() {
                PortDomain::Field
            } else {
                PortDomain::Signal
            },
            role: role_of(graph.origin_of(block)),
        });
        if let Some(slot) = sched.port_slot.get(&(block.clone(), port.clone())) {
            index.slot_to_port.push((slot.0, addr));
        }
    }

    // Defaulted inputs surface as ports too, so the editor can label
    // the synthesized value.
    for edge in &graph.edges {
        if graph.origin_of(&edge.from.block) != BlockOrigin::Default {
            continue;
        }
        let value = lowered
            .outputs
            .get(&(edge.from.block.clone(), edge.from.port.clone()));
        let domain = match value {
            Some(v) if v.is_field() => PortDomain::Field,
            _ => PortDomain::Signal,
        };
        index.ports.push(PortEntry {
            port: format!("{}:{}", edge.to.block, edge.to.port),
            block: edge.to.block.clone(),
            port_name: edge.to.port.clone(),
            dir: PortDir::In,
            domain,
            role: PortRole::Default,
        });
    }

    index.step_to_block = sched.steps.iter().map(|s| s.block).collect();
    index.slot_to_block = sched.slot_block.clone();
    index
}

// ---------------------------------------------------------------------------
// Edge-mapping service
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct EdgeBinding {
    pub slot: Slot,
    pub ty: CanonType,
    pub cardinality: Cardinality,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnmapReason {
    BlockEliminated,
    PortNotFound,
    SlotNotAllocated,
    DebugIndexMissing,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnmappedEdge {
    pub edge: String,
    pub reason: UnmapReason,
    pub detail: String,
}

// The joined view of one patch against one program.
pub struct EdgeMapper {
    pub edge_map: HashMap<String, EdgeBinding>,
    pub port_map: HashMap<String, EdgeBinding>,
    pub unmapped: Vec<UnmappedEdge>,
}

impl EdgeMapper {
    pub fn resolve_port(&self, addr: &str) -> Option<&EdgeBinding> {
        self.port_map.get(addr)
    }
}

pub fn map_edges(patch: &Patch, program: &CompiledProgram) -> EdgeMapper {
    let mut mapper = EdgeMapper {
        edge_map: HashMap::new(),
        port_map: HashMap::new(),
        unmapped: Vec::new(),
    };

    let index = match &program.debug {
        Some(index) => index,
        None => {
            for edge in patch.edges() {
                mapper.unmapped.push(UnmappedEdge {
                    edge: edge.id.clone(),
                    reason: UnmapReason::DebugIndexMissing,
                    detail: String::from("program carries no debug index"),
                });
            }
            return mapper;
        }
    };

    let live_blocks: HashMap<&str, u32> = index
        .block_map
        .iter()
        .map(|(i, id)| (id.as_str(), *i))
        .collect();
    let slot_of_port: HashMap<&str, u32> = index
        .slot_to_port
        .iter()
        .map(|(slot, addr)| (addr.as_str(), *slot))
        .collect();

    let binding_for = |addr: &str| -> Option<EdgeBinding> {
        let slot = slot_of_port.get(addr)?;
        let meta = program.slot_meta_for(*slot)?;
        Some(EdgeBinding {
            slot: Slot(*slot),
            ty: meta.ty,
            cardinality: meta
                .ty
                .extent
                .cardinality
                .fixed()
                .unwrap_or(Cardinality::One),
        })
    };

    // Everything with a slot is addressable by port, wired or not.
    for (slot, addr) in &index.slot_to_port {
        if let Some(meta) = program.slot_meta_for(*slot) {
            mapper.port_map.insert(
                addr.clone(),
                EdgeBinding {
                    slot: Slot(*slot),
                    ty: meta.ty,
                    cardinality: meta
                        .ty
                        .extent
                        .cardinality
                        .fixed()
                        .unwrap_or(Cardinality::One),
                },
            );
        }
    }

    for edge in patch.edges() {
        let addr = format!("{}", edge.from);
        if let Some(binding) = binding_for(&addr) {
            mapper.edge_map.insert(edge.id.clone(), binding);
            continue;
        }
        let (reason, detail) = if !live_blocks.contains_key(edge.from.block.as_str()) {
            (
                UnmapReason::BlockEliminated,
                format!("block {} is not in the compiled program", edge.from.block),
            )
        } else if !index.ports.iter().any(|p| p.port == addr && p.dir == PortDir::Out) {
            (
                UnmapReason::PortNotFound,
                format!("no lowered output at {}", addr),
            )
        } else {
            (
                UnmapReason::SlotNotAllocated,
                format!("{} was fused and has no slot", addr),
            )
        };
        mapper.unmapped.push(UnmappedEdge {
            edge: edge.id.clone(),
            reason,
            detail,
        });
    }

    mapper
}
