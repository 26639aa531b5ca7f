// The patch: the graph the user edits.
//
// Blocks, edges, and vararg connections are purely structural; ports
// hold no values. Structural invariants are enforced at the point of
// mutation, so a Patch in hand is always well-formed. A patch arriving
// over the wire is re-checked with validate() since serde bypasses the
// mutators.

use std::collections::{HashMap, HashSet};
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::diag::{codes, DiagKind, Diagnostic};
use crate::registry::{Config, InputDef, OutputDef, Registry};

lazy_static! {
    static ref ID_REGEX: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_-]*$").unwrap();
    static ref ADDR_REGEX: Regex =
        Regex::new("^([A-Za-z_$][A-Za-z0-9_.$-]*):([A-Za-z_][A-Za-z0-9_]*)$").unwrap();
}

// Canonical address of a port: "blockId:portName". Synthetic blocks
// inserted by the compiler use '$'/'.' in their ids, which user ids
// cannot contain, so the namespaces never collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub block: String,
    pub port: String,
}

impl Address {
    pub fn new(block: impl Into<String>, port: impl Into<String>) -> Address {
        Address {
            block: block.into(),
            port: port.into(),
        }
    }

    pub fn parse(text: &str) -> Result<Address, String> {
        match ADDR_REGEX.captures(text) {
            Some(caps) => Ok(Address {
                block: String::from(&caps[1]),
                port: String::from(&caps[2]),
            }),
            None => Err(format!("malformed address {:?}", text)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub config: Config,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from: Address,
    pub to: Address,
}

// One entry in a vararg port's ordered connection list. Sort keys are
// compared lexicographically; ties fall back to the source address so
// the order is total.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VarargConnection {
    pub source: Address,
    pub sort_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VarargInput {
    pub block: String,
    pub port: String,
    pub connections: Vec<VarargConnection>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    blocks: Vec<Block>,
    edges: Vec<Edge>,
    #[serde(default)]
    varargs: Vec<VarargInput>,
}

fn violation(message: String) -> Diagnostic {
    Diagnostic::new(DiagKind::Patch, codes::PATCH_VIOLATION, message)
}

impl Patch {
    pub fn new() -> Patch {
        Patch::default()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn varargs(&self) -> &[VarargInput] {
        &self.varargs
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn add_block(
        &mut self,
        id: impl Into<String>,
        block_type: impl Into<String>,
        config: Config,
    ) -> Result<(), Diagnostic> {
        let id = id.into();
        if !ID_REGEX.is_match(&id) {
            return Err(violation(format!("illegal block id {:?}", id)).at_block(id.clone()));
        }
        if self.block(&id).is_some() {
            return Err(violation(format!("duplicate block id {:?}", id)).at_block(id));
        }
        self.blocks.push(Block {
            id,
            block_type: block_type.into(),
            config,
        });
        Ok(())
    }

    pub fn add_edge(
        &mut self,
        id: impl Into<String>,
        from: &str,
        to: &str,
    ) -> Result<(), Diagnostic> {
        let id = id.into();
        let from = Address::parse(from).map_err(|e| violation(e))?;
        let to = Address::parse(to).map_err(|e| violation(e))?;
        self.check_edge(&id, &from, &to)?;
        self.edges.push(Edge { id, from, to });
        Ok(())
    }

    fn check_edge(&self, id: &str, from: &Address, to: &Address) -> Result<(), Diagnostic> {
        if self.edges.iter().any(|e| e.id == id) {
            return Err(violation(format!("duplicate edge id {:?}", id)));
        }
        if from.block == to.block {
            return Err(violation(format!("self-loop on block {:?}", from.block))
                .at_block(from.block.clone()));
        }
        if self.block(&from.block).is_none() {
            return Err(violation(format!("edge {:?} from unknown block {:?}", id, from.block)));
        }
        if self.block(&to.block).is_none() {
            return Err(violation(format!("edge {:?} into unknown block {:?}", id, to.block)));
        }
        // Vararg connections travel through connect_vararg, so every
        // plain input admits at most one edge.
        if self
            .edges
            .iter()
            .any(|e| e.to == *to)
        {
            return Err(
                violation(format!("input {} already has a connection", to))
                    .at_port(to.block.clone(), to.port.clone()),
            );
        }
        Ok(())
    }

    pub fn connect_vararg(
        &mut self,
        block: &str,
        port: &str,
        source: &str,
        sort_key: impl Into<String>,
    ) -> Result<(), Diagnostic> {
        if self.block(block).is_none() {
            return Err(violation(format!("unknown block {:?}", block)));
        }
        let source = Address::parse(source).map_err(violation)?;
        if source.block == block {
            return Err(violation(format!("self-loop on block {:?}", block))
                .at_block(String::from(block)));
        }
        let conn = VarargConnection {
            source,
            sort_key: sort_key.into(),
        };
        if let Some(va) = self
            .varargs
            .iter_mut()
            .find(|v| v.block == block && v.port == port)
        {
            va.connections.push(conn);
        } else {
            self.varargs.push(VarargInput {
                block: String::from(block),
                port: String::from(port),
                connections: vec![conn],
            });
        }
        Ok(())
    }

    pub fn vararg_for(&self, block: &str, port: &str) -> Option<&VarargInput> {
        self.varargs
            .iter()
            .find(|v| v.block == block && v.port == port)
    }

    // Re-run the mutation-point checks on a deserialized patch.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let mut ids = HashSet::new();
        for b in &self.blocks {
            if !ID_REGEX.is_match(&b.id) {
                out.push(violation(format!("illegal block id {:?}", b.id)).at_block(b.id.clone()));
            }
            if !ids.insert(b.id.as_str()) {
                out.push(violation(format!("duplicate block id {:?}", b.id)).at_block(b.id.clone()));
            }
        }
        let mut edge_ids = HashSet::new();
        let mut targets = HashSet::new();
        for e in &self.edges {
            if !edge_ids.insert(e.id.as_str()) {
                out.push(violation(format!("duplicate edge id {:?}", e.id)));
            }
            if e.from.block == e.to.block {
                out.push(
                    violation(format!("self-loop on block {:?}", e.from.block))
                        .at_block(e.from.block.clone()),
                );
            }
            if self.block(&e.from.block).is_none() {
                out.push(violation(format!("edge {:?} from unknown block {:?}", e.id, e.from.block)));
            }
            if self.block(&e.to.block).is_none() {
                out.push(violation(format!("edge {:?} into unknown block {:?}", e.id, e.to.block)));
            }
            if !targets.insert(&e.to) {
                out.push(
                    violation(format!("input {} already has a connection", e.to))
                        .at_port(e.to.block.clone(), e.to.port.clone()),
                );
            }
        }
        out
    }
}

// Resolves canonical addresses against a block list and the registry.
// Works for both user patches and the compiler's working graph, which
// reuses the same Block record.
pub enum AddrTarget<'a> {
    Input(&'a Block, &'a InputDef),
    Output(&'a Block, &'a OutputDef),
}

pub struct AddressRegistry<'a> {
    blocks: HashMap<&'a str, &'a Block>,
    registry: &'a Registry,
}

impl<'a> AddressRegistry<'a> {
    pub fn new(blocks: &'a [Block], registry: &'a Registry) -> AddressRegistry<'a> {
        AddressRegistry {
            blocks: blocks.iter().map(|b| (b.id.as_str(), b)).collect(),
            registry,
        }
    }

    pub fn resolve(&self, addr: &Address) -> Result<AddrTarget<'a>, String> {
        let block = self
            .blocks
            .get(addr.block.as_str())
            .ok_or_else(|| format!("unknown block {:?}", addr.block))?;
        let def = self
            .registry
            .get(&block.block_type)
            .ok_or_else(|| format!("unknown block type {:?}", block.block_type))?;
        if let Some(output) = def.get_output(&addr.port) {
            return Ok(AddrTarget::Output(block, output));
        }
        if let Some(input) = def.get_input(&addr.port) {
            return Ok(AddrTarget::Input(block, input));
        }
        Err(format!("block {:?} has no port {:?}", addr.block, addr.port))
    }

    pub fn resolve_output(&self, addr: &Address) -> Result<(&'a Block, &'a OutputDef), String> {
        match self.resolve(addr)? {
            AddrTarget::Output(b, o) => Ok((b, o)),
            AddrTarget::Input(..) => Err(format!("{} is an input, not an output", addr)),
        }
    }

    pub fn resolve_input(&self, addr: &Address) -> Result<(&'a Block, &'a InputDef), String> {
        match self.resolve(addr)? {
            AddrTarget::Input(b, i) => Ok((b, i)),
            AddrTarget::Output(..) => Err(format!("{} is an output, not an input", addr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::codes;

    fn empty_config() -> Config {
        Config::new()
    }

    #[test]
    fn test_address_parsing() {
        let a = Address::parse("osc:out").unwrap();
        assert_eq!(a.block, "osc");
        assert_eq!(a.port, "out");
        assert_eq!(format!("{}", a), "osc:out");

        assert!(Address::parse("nocolon").is_err());
        assert!(Address::parse(":port").is_err());
        assert!(Address::parse("block:").is_err());
        assert!(Address::parse("a:b:c").is_err());

        // Synthetic compiler ids resolve too.
        assert!(Address::parse("$default.osc.freq:out").is_ok());
    }

    #[test]
    fn test_duplicate_block_id() {
        let mut p = Patch::new();
        p.add_block("a", "Const", empty_config()).unwrap();
        let err = p.add_block("a", "Const", empty_config()).unwrap_err();
        assert_eq!(err.code, codes::PATCH_VIOLATION);
    }

    #[test]
    fn test_illegal_block_id() {
        let mut p = Patch::new();
        assert!(p.add_block("$nope", "Const", empty_config()).is_err());
        assert!(p.add_block("has space", "Const", empty_config()).is_err());
        assert!(p.add_block("ok_id-2", "Const", empty_config()).is_ok());
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut p = Patch::new();
        p.add_block("a", "Sin", empty_config()).unwrap();
        let err = p.add_edge("e1", "a:out", "a:theta").unwrap_err();
        assert_eq!(err.code, codes::PATCH_VIOLATION);
    }

    #[test]
    fn test_single_edge_per_input() {
        let mut p = Patch::new();
        p.add_block("a", "Const", empty_config()).unwrap();
        p.add_block("b", "Const", empty_config()).unwrap();
        p.add_block("c", "Sin", empty_config()).unwrap();
        p.add_edge("e1", "a:out", "c:theta").unwrap();
        let err = p.add_edge("e2", "b:out", "c:theta").unwrap_err();
        assert_eq!(err.code, codes::PATCH_VIOLATION);
    }

    #[test]
    fn test_duplicate_edge_id() {
        let mut p = Patch::new();
        p.add_block("a", "Const", empty_config()).unwrap();
        p.add_block("b", "Sin", empty_config()).unwrap();
        p.add_block("c", "Cos", empty_config()).unwrap();
        p.add_edge("e1", "a:out", "b:theta").unwrap();
        let err = p.add_edge("e1", "a:out", "c:theta").unwrap_err();
        assert_eq!(err.code, codes::PATCH_VIOLATION);
    }

    #[test]
    fn test_vararg_connections_accumulate() {
        let mut p = Patch::new();
        p.add_block("a", "Const", empty_config()).unwrap();
        p.add_block("b", "Const", empty_config()).unwrap();
        p.add_block("m", "Merge", empty_config()).unwrap();
        p.connect_vararg("m", "items", "a:out", "10").unwrap();
        p.connect_vararg("m", "items", "b:out", "05").unwrap();
        let va = p.vararg_for("m", "items").unwrap();
        assert_eq!(va.connections.len(), 2);
    }

    #[test]
    fn test_validate_roundtrip() {
        let mut p = Patch::new();
        p.add_block("a", "Const", empty_config()).unwrap();
        p.add_block("b", "Sin", empty_config()).unwrap();
        p.add_edge("e1", "a:out", "b:theta").unwrap();
        assert!(p.validate().is_empty());

        let json = serde_json::to_string(&p).unwrap();
        let back: Patch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(back.validate().is_empty());
    }
}
