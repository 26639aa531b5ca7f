// Frontend passes.
//
// The compiler never mutates its input patch. Pass 0 copies it into a
// working Graph (expanding macro blocks), and the later passes
// annotate that copy: default sources become synthetic blocks, unit
// mismatches become adapter blocks, every block gets a deterministic
// index, vararg connections are resolved and ordered. Each pass
// collects all of its diagnostics before the pipeline decides whether
// to continue; order between passes matters.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::diag::{codes, DiagKind, Diagnostic};
use crate::patch::{Address, AddressRegistry, Block, Edge, Patch, VarargInput};
use crate::registry::{
    BlockForm, Capability, CardinalityConstraint, CardinalityMode, Config, DefaultSource,
    PortCard, PortPayload, Registry,
};
use crate::trace;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockOrigin {
    User,
    Default,
    Adapter,
    MacroInner,
}

// The compiler-owned working copy of a patch.
pub struct Graph {
    pub blocks: Vec<Block>,
    pub edges: Vec<Edge>,
    pub varargs: Vec<VarargInput>,
    pub origin: HashMap<String, BlockOrigin>,
    // Filled by pass 3.
    pub order: Vec<String>,
    pub block_index: HashMap<String, u32>,
}

impl Graph {
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn edge_into(&self, block: &str, port: &str) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.to.block == block && e.to.port == port)
    }

    pub fn origin_of(&self, id: &str) -> BlockOrigin {
        self.origin
            .get(id)
            .cloned()
            .unwrap_or(BlockOrigin::User)
    }

    pub fn index_of(&self, id: &str) -> Option<u32> {
        self.block_index.get(id).cloned()
    }
}

// Expansion depth cap; a macro expanding into another macro is fine,
// a cycle of them is not.
const MAX_MACRO_DEPTH: usize = 8;

// Pass 0: copy the patch into a working graph, expanding macros into
// their primitive innards and rewiring edges across the boundary.
// Also resolves every plain edge endpoint so later passes can assume
// both ends exist.
pub fn expand_macros(patch: &Patch, registry: &Registry) -> Result<Graph, Vec<Diagnostic>> {
    let mut g = Graph {
        blocks: patch.blocks().to_vec(),
        edges: patch.edges().to_vec(),
        varargs: patch.varargs().to_vec(),
        origin: patch
            .blocks()
            .iter()
            .map(|b| (b.id.clone(), BlockOrigin::User))
            .collect(),
        order: Vec::new(),
        block_index: HashMap::new(),
    };
    let mut errors = Vec::new();

    for _ in 0..MAX_MACRO_DEPTH {
        let macros: Vec<Block> = g
            .blocks
            .iter()
            .filter(|b| match registry.get(&b.block_type) {
                Some(def) => def.form == BlockForm::Macro,
                None => false,
            })
            .cloned()
            .collect();
        if macros.is_empty() {
            break;
        }
        for m in macros {
            if let Err(d) = expand_one(&mut g, registry, &m) {
                errors.push(d);
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
    }
    if g.blocks.iter().any(|b| {
        registry
            .get(&b.block_type)
            .map_or(false, |d| d.form == BlockForm::Macro)
    }) {
        errors.push(Diagnostic::new(
            DiagKind::Patch,
            codes::PATCH_VIOLATION,
            "macro expansion did not terminate",
        ));
    }

    for b in &g.blocks {
        if registry.get(&b.block_type).is_none() {
            errors.push(
                Diagnostic::new(
                    DiagKind::Patch,
                    codes::PATCH_VIOLATION,
                    format!("unknown block type {:?}", b.block_type),
                )
                .at_block(b.id.clone()),
            );
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    // Every plain edge must run output -> non-vararg input.
    let addresses = AddressRegistry::new(&g.blocks, registry);
    for e in &g.edges {
        match addresses.resolve_output(&e.from) {
            Ok(_) => {}
            Err(msg) => errors.push(
                Diagnostic::new(DiagKind::Patch, codes::INVALID_ADDRESS, msg)
                    .at_port(e.from.block.clone(), e.from.port.clone()),
            ),
        }
        match addresses.resolve_input(&e.to) {
            Ok((_, input)) => {
                if input.is_vararg() {
                    errors.push(
                        Diagnostic::new(
                            DiagKind::Patch,
                            codes::PATCH_VIOLATION,
                            format!("vararg input {} takes connections, not edges", e.to),
                        )
                        .at_port(e.to.block.clone(), e.to.port.clone()),
                    );
                }
            }
            Err(msg) => errors.push(
                Diagnostic::new(DiagKind::Patch, codes::INVALID_ADDRESS, msg)
                    .at_port(e.to.block.clone(), e.to.port.clone()),
            ),
        }
    }

    if errors.is_empty() {
        Ok(g)
    } else {
        Err(errors)
    }
}

fn expand_one(g: &mut Graph, registry: &Registry, m: &Block) -> Result<(), Diagnostic> {
    let def = registry.require(&m.block_type)?;
    let expand = def.expand.expect("validated macro has expansion");
    let expansion = expand(&m.config).map_err(|msg| {
        Diagnostic::new(
            DiagKind::Patch,
            codes::PATCH_VIOLATION,
            format!("{}: {}", m.block_type, msg),
        )
        .at_block(m.id.clone())
    })?;

    let inner_id = |suffix: &str| format!("{}.{}", m.id, suffix);
    let rewrite = |addr: &str| -> Result<Address, Diagnostic> {
        let a = Address::parse(addr).map_err(|e| {
            Diagnostic::new(DiagKind::Patch, codes::PATCH_VIOLATION, e).at_block(m.id.clone())
        })?;
        Ok(Address::new(inner_id(&a.block), a.port))
    };

    for (suffix, block_type, config) in &expansion.blocks {
        let id = inner_id(suffix);
        g.origin.insert(id.clone(), BlockOrigin::MacroInner);
        g.blocks.push(Block {
            id,
            block_type: String::from(*block_type),
            config: config.clone(),
        });
    }
    for (i, (from, to)) in expansion.edges.iter().enumerate() {
        g.edges.push(Edge {
            id: format!("$e.macro.{}.{}", m.id, i),
            from: rewrite(from)?,
            to: rewrite(to)?,
        });
    }

    // Rewire the boundary: edges touching the macro's ports land on
    // the inner addresses the expansion named.
    let in_map: BTreeMap<&str, &String> = expansion
        .inputs
        .iter()
        .map(|(p, a)| (*p, a))
        .collect();
    let out_map: BTreeMap<&str, &String> = expansion
        .outputs
        .iter()
        .map(|(p, a)| (*p, a))
        .collect();
    for e in g.edges.iter_mut() {
        if e.to.block == m.id {
            match in_map.get(e.to.port.as_str()) {
                Some(addr) => e.to = rewrite(addr)?,
                None => {
                    return Err(Diagnostic::new(
                        DiagKind::Patch,
                        codes::INVALID_ADDRESS,
                        format!("macro {} has no input {}", m.block_type, e.to.port),
                    )
                    .at_port(m.id.clone(), e.to.port.clone()))
                }
            }
        }
        if e.from.block == m.id {
            match out_map.get(e.from.port.as_str()) {
                Some(addr) => e.from = rewrite(addr)?,
                None => {
                    return Err(Diagnostic::new(
                        DiagKind::Patch,
                        codes::INVALID_ADDRESS,
                        format!("macro {} has no output {}", m.block_type, e.from.port),
                    )
                    .at_port(m.id.clone(), e.from.port.clone()))
                }
            }
        }
    }
    for va in g.varargs.iter_mut() {
        for conn in va.connections.iter_mut() {
            if conn.source.block == m.id {
                if let Some(addr) = out_map.get(conn.source.port.as_str()) {
                    conn.source = rewrite(addr)?;
                }
            }
        }
    }

    g.blocks.retain(|b| b.id != m.id);
    g.origin.remove(&m.id);
    trace!("expanded macro {} ({})", m.id, m.block_type);
    Ok(())
}

// Pass 1: give every unconnected, non-vararg input either a synthetic
// source block or a MissingInput diagnostic.
pub fn insert_defaults(g: &mut Graph, registry: &Registry) -> Vec<Diagnostic> {
    let mut errors = Vec::new();
    let mut inserts: Vec<(Block, Edge)> = Vec::new();

    for b in &g.blocks {
        let def = match registry.get(&b.block_type) {
            Some(def) => def,
            None => continue,
        };
        for (port, input) in &def.inputs {
            if input.is_vararg() || g.edge_into(&b.id, port).is_some() {
                continue;
            }
            match &input.default_source {
                Some(source) => {
                    let id = format!("$default.{}.{}", b.id, port);
                    let (block_type, out_port, config) = match source {
                        DefaultSource::Const(v) => {
                            let mut c = Config::new();
                            c.insert(String::from("value"), serde_json::json!(v));
                            ("Const", "out", c)
                        }
                        DefaultSource::TimeRoot => ("Time", "t", Config::new()),
                    };
                    inserts.push((
                        Block {
                            id: id.clone(),
                            block_type: String::from(block_type),
                            config,
                        },
                        Edge {
                            id: format!("$e.default.{}.{}", b.id, port),
                            from: Address::new(id, out_port),
                            to: Address::new(b.id.clone(), *port),
                        },
                    ));
                }
                None if input.optional => {}
                None => errors.push(
                    Diagnostic::new(
                        DiagKind::Default,
                        codes::MISSING_INPUT,
                        format!("required input {}:{} has no connection", b.id, port),
                    )
                    .at_port(b.id.clone(), *port),
                ),
            }
        }
    }

    for (block, edge) in inserts {
        g.origin.insert(block.id.clone(), BlockOrigin::Default);
        g.blocks.push(block);
        g.edges.push(edge);
    }
    errors
}

// Pass 2: reconcile unit mismatches along edges by splicing in
// registered adapter blocks.
pub fn insert_adapters(g: &mut Graph, registry: &Registry) -> Vec<Diagnostic> {
    let mut errors = Vec::new();
    let mut splices: Vec<(usize, Block, Edge, Edge)> = Vec::new();

    {
        let addresses = AddressRegistry::new(&g.blocks, registry);
        for (i, e) in g.edges.iter().enumerate() {
            let from_unit = match addresses.resolve_output(&e.from) {
                Ok((_, out)) => out.ty.unit,
                Err(_) => continue,
            };
            let to_unit = match addresses.resolve_input(&e.to) {
                Ok((_, input)) => input.ty.unit,
                Err(_) => continue,
            };
            if from_unit.agrees_with(to_unit) {
                continue;
            }
            match registry.find_adapter(from_unit, to_unit) {
                Some(adapter) => {
                    let id = format!("$adapt.{}", e.id);
                    splices.push((
                        i,
                        Block {
                            id: id.clone(),
                            block_type: String::from(adapter.type_name),
                            config: Config::new(),
                        },
                        Edge {
                            id: format!("$e.adapt.{}.a", e.id),
                            from: e.from.clone(),
                            to: Address::new(id.clone(), "in"),
                        },
                        Edge {
                            id: format!("$e.adapt.{}.b", e.id),
                            from: Address::new(id, "out"),
                            to: e.to.clone(),
                        },
                    ));
                }
                None => errors.push(
                    Diagnostic::new(
                        DiagKind::Adapter,
                        codes::UNIT_MISMATCH,
                        format!(
                            "no adapter from {:?} to {:?} on edge {}",
                            from_unit, to_unit, e.id
                        ),
                    )
                    .at_port(e.to.block.clone(), e.to.port.clone()),
                ),
            }
        }
    }

    // Splice back-to-front so stored indices stay valid.
    for (i, block, first, second) in splices.into_iter().rev() {
        g.edges.remove(i);
        g.origin.insert(block.id.clone(), BlockOrigin::Adapter);
        g.blocks.push(block);
        g.edges.push(first);
        g.edges.push(second);
    }
    errors
}

// Pass 3: deterministic block indexing by topological order, ties
// broken by id. The dependency graph omits in-edges of state blocks
// (the state-write -> state-read cut), so feedback through state is
// legal; anything still cyclic after the cut is an error.
pub fn index_blocks(g: &mut Graph, registry: &Registry) -> Vec<Diagnostic> {
    let mut deps: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    let mut rdeps: HashMap<&str, Vec<&str>> = HashMap::new();
    for b in &g.blocks {
        deps.insert(&b.id, BTreeSet::new());
    }

    let is_state = |id: &str| -> bool {
        g.block(id)
            .and_then(|b| registry.get(&b.block_type))
            .map_or(false, |d| d.capability == Capability::State)
    };

    let block_ids: Vec<&str> = g.blocks.iter().map(|b| b.id.as_str()).collect();
    let find = |id: &str| -> Option<&str> { block_ids.iter().find(|b| **b == id).cloned() };

    let mut edge_pairs: Vec<(&str, &str)> = Vec::new();
    for e in &g.edges {
        if is_state(&e.to.block) {
            continue;
        }
        if let (Some(f), Some(t)) = (find(&e.from.block), find(&e.to.block)) {
            edge_pairs.push((f, t));
        }
    }
    for va in &g.varargs {
        if is_state(&va.block) {
            continue;
        }
        for conn in &va.connections {
            if let (Some(f), Some(t)) = (find(&conn.source.block), find(&va.block)) {
                edge_pairs.push((f, t));
            }
        }
    }
    for (f, t) in edge_pairs {
        deps.get_mut(t).map(|s| s.insert(f));
        rdeps.entry(f).or_insert_with(Vec::new).push(t);
    }

    // Kahn with a sorted ready set: smallest id first.
    let mut ready: BTreeSet<&str> = deps
        .iter()
        .filter(|(_, d)| d.is_empty())
        .map(|(id, _)| *id)
        .collect();
    let mut remaining: HashMap<&str, usize> =
        deps.iter().map(|(id, d)| (*id, d.len())).collect();
    let mut order = Vec::new();

    while let Some(id) = ready.iter().next().cloned() {
        ready.remove(id);
        order.push(String::from(id));
        if let Some(nexts) = rdeps.get(id) {
            for next in nexts.clone() {
                let n = remaining.get_mut(next).expect("dep counted");
                *n -= 1;
                if *n == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() != g.blocks.len() {
        let mut stuck: Vec<&str> = remaining
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(id, _)| *id)
            .collect();
        stuck.sort();
        return vec![Diagnostic::new(
            DiagKind::Scheduling,
            codes::CYCLE_DETECTED,
            format!("cycle through blocks: {}", stuck.join(", ")),
        )];
    }

    g.block_index = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i as u32))
        .collect();
    g.order = order;
    trace!("indexed {} blocks", g.blocks.len());
    Vec::new()
}

// Pass 4: resolve and order vararg connections, and check them
// against the declared constraint. Read-only except the ordering.
pub fn validate_varargs(g: &mut Graph, registry: &Registry) -> Vec<Diagnostic> {
    let mut errors = Vec::new();

    // Order first: lexicographic sort key, source address tiebreak.
    for va in g.varargs.iter_mut() {
        va.connections.sort_by(|a, b| {
            (&a.sort_key, format!("{}", a.source)).cmp(&(&b.sort_key, format!("{}", b.source)))
        });
    }

    let addresses = AddressRegistry::new(&g.blocks, registry);

    // Connection lists targeting something that is not a vararg
    // input are addressing errors in their own right.
    for va in &g.varargs {
        let target = Address::new(va.block.clone(), va.port.clone());
        match addresses.resolve_input(&target) {
            Ok((_, input)) if input.is_vararg() => {}
            Ok(_) => errors.push(
                Diagnostic::new(
                    DiagKind::Vararg,
                    codes::INVALID_ADDRESS,
                    format!("{} is not a vararg input", target),
                )
                .at_port(va.block.clone(), va.port.clone()),
            ),
            Err(msg) => errors.push(
                Diagnostic::new(DiagKind::Vararg, codes::INVALID_ADDRESS, msg)
                    .at_port(va.block.clone(), va.port.clone()),
            ),
        }
    }

    // Check every declared vararg port, connected or not, so count
    // minimums hold for empty lists too.
    static NO_CONNECTIONS: &[crate::patch::VarargConnection] = &[];
    for b in &g.blocks {
        let def = match registry.get(&b.block_type) {
            Some(def) => def,
            None => continue,
        };
        for (port, input) in &def.inputs {
            let constraint = match &input.vararg {
                Some(c) => c,
                None => continue,
            };
            let connections: &[crate::patch::VarargConnection] = g
                .varargs
                .iter()
                .find(|v| v.block == b.id && v.port == *port)
                .map(|v| v.connections.as_slice())
                .unwrap_or(NO_CONNECTIONS);

            for (i, conn) in connections.iter().enumerate() {
                let (src_block, output) = match addresses.resolve_output(&conn.source) {
                    Ok(hit) => hit,
                    Err(msg) => {
                        errors.push(
                            Diagnostic::new(DiagKind::Vararg, codes::INVALID_ADDRESS, msg)
                                .at_port(b.id.clone(), *port)
                                .at_connection(i),
                        );
                        continue;
                    }
                };
                if let PortPayload::Fixed(p) = output.ty.payload {
                    if !constraint.payloads.contains(p) {
                        errors.push(
                            Diagnostic::new(
                                DiagKind::Vararg,
                                codes::TYPE_MISMATCH,
                                format!("{} carries payload {:?}", conn.source, p),
                            )
                            .at_port(b.id.clone(), *port)
                            .at_connection(i),
                        );
                    }
                }
                let src_mode = registry
                    .get(&src_block.block_type)
                    .map(|d| d.cardinality.mode);
                let src_card = effective_card(output.ty.card, src_mode);
                match (constraint.card, src_card) {
                    (CardinalityConstraint::Signal, Some(PortCard::Field))
                    | (CardinalityConstraint::Field, Some(PortCard::Signal)) => {
                        errors.push(
                            Diagnostic::new(
                                DiagKind::Vararg,
                                codes::CARDINALITY_MISMATCH,
                                format!(
                                    "{} does not satisfy the {:?} cardinality constraint",
                                    conn.source, constraint.card
                                ),
                            )
                            .at_port(b.id.clone(), *port)
                            .at_connection(i),
                        );
                    }
                    _ => {}
                }
            }

            let n = connections.len();
            if n < constraint.min || constraint.max.map_or(false, |max| n > max) {
                errors.push(
                    Diagnostic::new(
                        DiagKind::Vararg,
                        codes::CONNECTION_LIMIT,
                        format!(
                            "{}:{} has {} connections, allowed [{}, {}]",
                            b.id,
                            port,
                            n,
                            constraint.min,
                            constraint
                                .max
                                .map(|m| m.to_string())
                                .unwrap_or_else(|| String::from("inf")),
                        ),
                    )
                    .at_port(b.id.clone(), *port),
                );
            }
        }
    }
    errors
}

// What a port's declared cardinality means, given its block's mode.
// None means "not decidable before the solver runs".
fn effective_card(card: PortCard, mode: Option<CardinalityMode>) -> Option<PortCard> {
    match card {
        PortCard::Signal => Some(PortCard::Signal),
        PortCard::Field => Some(PortCard::Field),
        PortCard::Inherit => match mode {
            Some(CardinalityMode::SignalOnly) => Some(PortCard::Signal),
            Some(CardinalityMode::FieldOnly) => Some(PortCard::Field),
            _ => None,
        },
    }
}
