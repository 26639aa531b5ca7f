// Flow-based type inference over the working graph.
//
// Every port's declared type is a schema; payload and cardinality
// positions may be fresh variables, shared across the ports of one
// block (all generic ports bind to a single payload variable, all
// cardinality-preserving ports to a single cardinality variable).
// Edges unify the two sides. Cardinality has one extra rule: a
// resolved signal flowing into a resolved field is promoted for that
// edge alone when the consuming block allows zip-sig broadcasting,
// and the lowering inserts the Broadcast.
//
// After solving, every port is fully concrete. Unresolved payloads
// default to float when the port admits it and fail otherwise;
// unresolved cardinalities default to signal.

use std::collections::{HashMap, HashSet};

use crate::diag::{codes, DiagKind, Diagnostic};
use crate::passes::Graph;
use crate::registry::{
    cfg_usize, BroadcastPolicy, CardinalityMode, PortCard, PortPayload, Registry,
};
use crate::trace;
use crate::types::{
    Cardinality, CanonType, Contract, Domain, Extent, InstanceId, Payload, PayloadSet, Temporality,
    Term,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Dir {
    In,
    Out,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortKey {
    pub block: String,
    pub port: String,
    pub dir: Dir,
}

impl PortKey {
    pub fn new(block: &str, port: &str, dir: Dir) -> PortKey {
        PortKey {
            block: String::from(block),
            port: String::from(port),
            dir,
        }
    }
}

// A field-originating block and the lanes it declares.
#[derive(Clone, Debug, PartialEq)]
pub struct InstancePlan {
    pub id: InstanceId,
    pub key: String,
    pub domain: Domain,
    pub count: usize,
}

// Solver output: fully-resolved port types plus everything lowering
// needs to know about fields and broadcasts.
#[derive(Debug)]
pub struct TypeMap {
    ports: HashMap<PortKey, CanonType>,
    pub block_instance: HashMap<String, (InstanceId, Domain)>,
    pub broadcast_edges: HashSet<String>,
    pub instances: Vec<InstancePlan>,
}

impl TypeMap {
    pub fn out_type(&self, block: &str, port: &str) -> Option<CanonType> {
        self.ports.get(&PortKey::new(block, port, Dir::Out)).cloned()
    }

    pub fn in_type(&self, block: &str, port: &str) -> Option<CanonType> {
        self.ports.get(&PortKey::new(block, port, Dir::In)).cloned()
    }

    pub fn ports(&self) -> impl Iterator<Item = (&PortKey, &CanonType)> {
        self.ports.iter()
    }
}

// Union-find over one kind of inference value.
struct Store<T: Copy + PartialEq + std::fmt::Debug> {
    parent: Vec<u32>,
    value: Vec<Option<T>>,
}

impl<T: Copy + PartialEq + std::fmt::Debug> Store<T> {
    fn new() -> Store<T> {
        Store {
            parent: Vec::new(),
            value: Vec::new(),
        }
    }

    fn fresh(&mut self) -> u32 {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        self.value.push(None);
        id
    }

    fn find(&mut self, i: u32) -> u32 {
        let p = self.parent[i as usize];
        if p == i {
            return i;
        }
        let root = self.find(p);
        self.parent[i as usize] = root;
        root
    }

    fn get(&mut self, i: u32) -> Option<T> {
        let root = self.find(i);
        self.value[root as usize]
    }

    // Union two classes; conflicting resolved values surface as the
    // pair so the caller can phrase the error (or apply the broadcast
    // promotion in the cardinality case).
    fn union(&mut self, a: u32, b: u32) -> Result<bool, (T, T)> {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return Ok(false);
        }
        match (self.value[ra as usize], self.value[rb as usize]) {
            (Some(x), Some(y)) if x != y => return Err((x, y)),
            (Some(x), _) => self.value[rb as usize] = Some(x),
            (_, Some(y)) => self.value[ra as usize] = Some(y),
            _ => {}
        }
        self.parent[ra as usize] = rb;
        Ok(true)
    }

    fn bind(&mut self, i: u32, v: T) -> Result<bool, (T, T)> {
        let root = self.find(i);
        match self.value[root as usize] {
            Some(x) if x == v => Ok(false),
            Some(x) => Err((x, v)),
            None => {
                self.value[root as usize] = Some(v);
                Ok(true)
            }
        }
    }

    // Forceful upgrade, used only for the signal->field promotion.
    fn rebind(&mut self, i: u32, v: T) {
        let root = self.find(i);
        self.value[root as usize] = Some(v);
    }
}

// Payload variables additionally carry the admissible set, which
// shrinks as classes merge.
struct PayloadStore {
    inner: Store<Payload>,
    allowed: Vec<PayloadSet>,
}

impl PayloadStore {
    fn new() -> PayloadStore {
        PayloadStore {
            inner: Store::new(),
            allowed: Vec::new(),
        }
    }

    fn fresh(&mut self, allowed: PayloadSet) -> u32 {
        self.allowed.push(allowed);
        self.inner.fresh()
    }

    fn get(&mut self, i: u32) -> Option<Payload> {
        self.inner.get(i)
    }

    fn allowed(&mut self, i: u32) -> PayloadSet {
        let root = self.inner.find(i);
        self.allowed[root as usize]
    }

    fn bind(&mut self, i: u32, v: Payload) -> Result<(), String> {
        let root = self.inner.find(i);
        if !self.allowed[root as usize].contains(v) {
            return Err(format!(
                "payload {:?} is not admissible here ({:?})",
                v, self.allowed[root as usize]
            ));
        }
        self.inner
            .bind(root, v)
            .map(|_| ())
            .map_err(|(a, b)| format!("payload {:?} conflicts with {:?}", b, a))
    }

    fn union(&mut self, a: u32, b: u32) -> Result<(), String> {
        let ra = self.inner.find(a);
        let rb = self.inner.find(b);
        if ra == rb {
            return Ok(());
        }
        let merged = self.allowed[ra as usize] & self.allowed[rb as usize];
        if merged.is_empty() {
            return Err(format!(
                "no payload satisfies both {:?} and {:?}",
                self.allowed[ra as usize], self.allowed[rb as usize]
            ));
        }
        if let Some(v) = self.inner.value[ra as usize].or(self.inner.value[rb as usize]) {
            if !merged.contains(v) {
                return Err(format!("payload {:?} is not admissible here", v));
            }
        }
        self.inner
            .union(ra, rb)
            .map_err(|(a, b)| format!("payload {:?} conflicts with {:?}", a, b))?;
        let root = self.inner.find(ra);
        self.allowed[root as usize] = merged;
        Ok(())
    }
}

// Solver-internal port schema instance.
#[derive(Clone)]
struct SPort {
    payload: Term<Payload>,
    unit: crate::types::Unit,
    contract: Contract,
    temporality: Term<Temporality>,
    cardinality: Term<Cardinality>,
    must_many: bool,
}

pub struct TypeChecker<'a> {
    graph: &'a Graph,
    registry: &'a Registry,
    payloads: PayloadStore,
    temps: Store<Temporality>,
    cards: Store<Cardinality>,
    ports: HashMap<PortKey, SPort>,
    instances: Vec<InstancePlan>,
    block_instance_fixed: HashMap<String, (InstanceId, Domain)>,
}

impl<'a> TypeChecker<'a> {
    pub fn new(graph: &'a Graph, registry: &'a Registry) -> TypeChecker<'a> {
        TypeChecker {
            graph,
            registry,
            payloads: PayloadStore::new(),
            temps: Store::new(),
            cards: Store::new(),
            ports: HashMap::new(),
            instances: Vec::new(),
            block_instance_fixed: HashMap::new(),
        }
    }

    pub fn solve(mut self) -> Result<TypeMap, Vec<Diagnostic>> {
        self.plan_instances();
        self.instantiate_ports();

        let mut errors = Vec::new();
        self.unify_payloads_and_temporality(&mut errors);
        self.run_cardinality_rounds();
        let (resolved, broadcast_edges) = self.resolve(&mut errors);

        if !errors.is_empty() {
            return Err(errors);
        }

        let mut block_instance = self.block_instance_fixed.clone();
        for (key, ty) in &resolved {
            if let Some((i, d)) = ty.instance() {
                block_instance.entry(key.block.clone()).or_insert((i, d));
            }
        }

        trace!("solved {} ports", resolved.len());
        Ok(TypeMap {
            ports: resolved,
            block_instance,
            broadcast_edges,
            instances: self.instances,
        })
    }

    // Assign instance ids to field-origin blocks, deterministically in
    // block-index order.
    fn plan_instances(&mut self) {
        let mut next = 0u32;
        for id in &self.graph.order {
            let block = match self.graph.block(id) {
                Some(b) => b,
                None => continue,
            };
            let def = match self.registry.get(&block.block_type) {
                Some(d) => d,
                None => continue,
            };
            if let Some(spec) = &def.instance {
                let count = cfg_usize(&block.config, spec.count_key)
                    .or_else(|| {
                        crate::registry::cfg_f64(&block.config, spec.count_key)
                            .map(|v| v.max(0.0) as usize)
                    })
                    .unwrap_or(spec.default_count)
                    * spec.count_scale;
                let plan = InstancePlan {
                    id: InstanceId(next),
                    key: block.id.clone(),
                    domain: spec.domain,
                    count,
                };
                next += 1;
                self.block_instance_fixed
                    .insert(block.id.clone(), (plan.id, plan.domain));
                self.instances.push(plan);
            }
        }
    }

    fn instantiate_ports(&mut self) {
        for block in &self.graph.blocks {
            let def = match self.registry.get(&block.block_type) {
                Some(d) => d,
                None => continue,
            };

            // One payload variable per block, constrained by the
            // intersection of every generic port's admissible set.
            let has_generic = def
                .inputs
                .iter()
                .map(|(_, i)| &i.ty)
                .chain(def.outputs.iter().map(|(_, o)| &o.ty))
                .any(|t| t.payload == PortPayload::Generic);
            let payload_var = if has_generic {
                let mut allowed = PayloadSet::all();
                if let Some(spec) = &def.payload {
                    for (port, set) in &spec.allowed {
                        let generic = def
                            .get_input(port)
                            .map(|i| i.ty.payload == PortPayload::Generic)
                            .or_else(|| {
                                def.get_output(port)
                                    .map(|o| o.ty.payload == PortPayload::Generic)
                            })
                            .unwrap_or(false);
                        if generic {
                            allowed = allowed & *set;
                        }
                    }
                }
                Some(self.payloads.fresh(allowed))
            } else {
                None
            };

            let shared_card = self.cards.fresh();
            let fixed_instance = self.block_instance_fixed.get(&block.id).cloned();

            let mut add = |tc: &mut TypeChecker<'a>, port: &str, ty: &crate::registry::PortType, dir: Dir| {
                let payload = match ty.payload {
                    PortPayload::Fixed(p) => Term::Fixed(p),
                    PortPayload::Generic => {
                        Term::Var(payload_var.expect("generic port implies payload var"))
                    }
                };
                let (cardinality, must_many) =
                    tc.card_term(ty.card, def.cardinality.mode, shared_card, fixed_instance);
                tc.ports.insert(
                    PortKey::new(&block.id, port, dir),
                    SPort {
                        payload,
                        unit: ty.unit,
                        contract: ty.contract,
                        temporality: Term::Fixed(ty.temporality),
                        cardinality,
                        must_many,
                    },
                );
            };

            let inputs: Vec<(&'static str, crate::registry::PortType)> = def
                .inputs
                .iter()
                .filter(|(_, i)| !i.is_vararg())
                .map(|(n, i)| (*n, i.ty.clone()))
                .collect();
            let outputs: Vec<(&'static str, crate::registry::PortType)> = def
                .outputs
                .iter()
                .map(|(n, o)| (*n, o.ty.clone()))
                .collect();
            for (name, ty) in inputs {
                add(self, name, &ty, Dir::In);
            }
            for (name, ty) in outputs {
                add(self, name, &ty, Dir::Out);
            }
        }
    }

    fn card_term(
        &mut self,
        card: PortCard,
        mode: CardinalityMode,
        shared: u32,
        fixed_instance: Option<(InstanceId, Domain)>,
    ) -> (Term<Cardinality>, bool) {
        match (card, mode) {
            (PortCard::Signal, _) | (PortCard::Inherit, CardinalityMode::SignalOnly) => {
                (Term::Fixed(Cardinality::One), false)
            }
            (PortCard::Field, _) | (PortCard::Inherit, CardinalityMode::FieldOnly) => {
                match fixed_instance {
                    Some((i, d)) => (Term::Fixed(Cardinality::Many(i, d)), false),
                    None => (Term::Var(shared), true),
                }
            }
            (PortCard::Inherit, CardinalityMode::Preserve) => (Term::Var(shared), false),
        }
    }

    fn unify_payloads_and_temporality(&mut self, errors: &mut Vec<Diagnostic>) {
        for edge in &self.graph.edges {
            let src = match self.port(&edge.from.block, &edge.from.port, Dir::Out) {
                Some(p) => p,
                None => continue,
            };
            let dst = match self.port(&edge.to.block, &edge.to.port, Dir::In) {
                Some(p) => p,
                None => continue,
            };

            let result = match (src.payload, dst.payload) {
                (Term::Fixed(a), Term::Fixed(b)) if a == b => Ok(()),
                (Term::Fixed(a), Term::Fixed(b)) => {
                    Err(format!("payload {:?} flows into {:?}", a, b))
                }
                (Term::Var(v), Term::Fixed(p)) | (Term::Fixed(p), Term::Var(v)) => {
                    self.payloads.bind(v, p)
                }
                (Term::Var(a), Term::Var(b)) => self.payloads.union(a, b),
            };
            if let Err(msg) = result {
                errors.push(
                    Diagnostic::new(DiagKind::Type, codes::TYPE_MISMATCH, msg)
                        .at_port(edge.to.block.clone(), edge.to.port.clone()),
                );
            }

            let result = match (src.temporality, dst.temporality) {
                (Term::Fixed(a), Term::Fixed(b)) if a == b => Ok(()),
                (Term::Fixed(a), Term::Fixed(b)) => Err(format!(
                    "{:?} output wired into {:?} input",
                    a, b
                )),
                (Term::Var(v), Term::Fixed(t)) | (Term::Fixed(t), Term::Var(v)) => self
                    .temps
                    .bind(v, t)
                    .map(|_| ())
                    .map_err(|(a, b)| format!("{:?} conflicts with {:?}", a, b)),
                (Term::Var(a), Term::Var(b)) => self
                    .temps
                    .union(a, b)
                    .map(|_| ())
                    .map_err(|(a, b)| format!("{:?} conflicts with {:?}", a, b)),
            };
            if let Err(msg) = result {
                errors.push(
                    Diagnostic::new(DiagKind::Type, codes::TYPE_MISMATCH, msg)
                        .at_port(edge.to.block.clone(), edge.to.port.clone()),
                );
            }
        }
    }

    // Cardinality flows to a fixpoint. Signal-into-field conflicts are
    // not resolved here; the final pass classifies them as broadcasts
    // or errors once everything else has settled.
    fn run_cardinality_rounds(&mut self) {
        let cap = self.graph.edges.len() + self.graph.blocks.len() + 2;
        for _ in 0..cap {
            let mut changed = false;
            for edge in &self.graph.edges {
                let src = match self.port(&edge.from.block, &edge.from.port, Dir::Out) {
                    Some(p) => p,
                    None => continue,
                };
                let dst = match self.port(&edge.to.block, &edge.to.port, Dir::In) {
                    Some(p) => p,
                    None => continue,
                };
                let s = self.card_of(src.cardinality);
                let d = self.card_of(dst.cardinality);
                match (src.cardinality, dst.cardinality, s, d) {
                    (Term::Var(a), Term::Var(b), None, None) => {
                        if let Ok(did) = self.cards.union(a, b) {
                            changed |= did;
                        }
                    }
                    (_, Term::Var(b), Some(v), None) => {
                        if let Ok(did) = self.cards.bind(b, v) {
                            changed |= did;
                        }
                    }
                    (Term::Var(a), _, None, Some(v)) => {
                        if let Ok(did) = self.cards.bind(a, v) {
                            changed |= did;
                        }
                    }
                    // Signal resolved on a variable-backed side meeting
                    // a field: promote the class to the field.
                    (Term::Var(a), _, Some(Cardinality::One), Some(Cardinality::Many(i, d))) => {
                        self.cards.rebind(a, Cardinality::Many(i, d));
                        changed = true;
                    }
                    (_, Term::Var(b), Some(Cardinality::Many(i, dm)), Some(Cardinality::One)) => {
                        if self.dst_allows_broadcast(&edge.to.block) {
                            self.cards.rebind(b, Cardinality::Many(i, dm));
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn dst_allows_broadcast(&self, block: &str) -> bool {
        self.graph
            .block(block)
            .and_then(|b| self.registry.get(&b.block_type))
            .map_or(false, |d| {
                d.cardinality.broadcast == BroadcastPolicy::AllowZipSig
            })
    }

    fn port(&self, block: &str, port: &str, dir: Dir) -> Option<SPort> {
        self.ports.get(&PortKey::new(block, port, dir)).cloned()
    }

    fn card_of(&mut self, term: Term<Cardinality>) -> Option<Cardinality> {
        match term {
            Term::Fixed(c) => Some(c),
            Term::Var(v) => self.cards.get(v),
        }
    }

    // Resolve every port to a concrete type, then classify every edge
    // as plain, broadcast, or error.
    fn resolve(
        &mut self,
        errors: &mut Vec<Diagnostic>,
    ) -> (HashMap<PortKey, CanonType>, HashSet<String>) {
        let mut resolved: HashMap<PortKey, CanonType> = HashMap::new();
        let mut keys: Vec<PortKey> = self.ports.keys().cloned().collect();
        // Stable resolution order keeps diagnostics deterministic.
        keys.sort_by(|a, b| {
            (&a.block, &a.port, a.dir == Dir::Out).cmp(&(&b.block, &b.port, b.dir == Dir::Out))
        });
        for key in keys {
            let sport = self.ports.get(&key).cloned().expect("known port");
            let payload = match sport.payload {
                Term::Fixed(p) => Some(p),
                Term::Var(v) => match self.payloads.get(v) {
                    Some(p) => Some(p),
                    None if self.payloads.allowed(v).contains(Payload::Float) => {
                        // Nothing constrained this port; default it.
                        let _ = self.payloads.bind(v, Payload::Float);
                        Some(Payload::Float)
                    }
                    None => {
                        errors.push(
                            Diagnostic::new(
                                DiagKind::Type,
                                codes::TYPE_MISMATCH,
                                format!("payload of {}:{} never resolved", key.block, key.port),
                            )
                            .at_port(key.block.clone(), key.port.clone()),
                        );
                        None
                    }
                },
            };
            let cardinality = match sport.cardinality {
                Term::Fixed(c) => c,
                Term::Var(v) => self.cards.get(v).unwrap_or(Cardinality::One),
            };
            if sport.must_many && cardinality == Cardinality::One {
                errors.push(
                    Diagnostic::new(
                        DiagKind::Type,
                        codes::CARDINALITY_MISMATCH,
                        format!("{}:{} requires a field", key.block, key.port),
                    )
                    .at_port(key.block.clone(), key.port.clone()),
                );
            }
            let temporality = match sport.temporality {
                Term::Fixed(t) => t,
                Term::Var(v) => self.temps.get(v).unwrap_or(Temporality::Continuous),
            };
            if let Some(p) = payload {
                resolved.insert(
                    key,
                    CanonType {
                        payload: Term::Fixed(p),
                        unit: sport.unit,
                        extent: Extent {
                            temporality: Term::Fixed(temporality),
                            cardinality: Term::Fixed(cardinality),
                        },
                        contract: sport.contract,
                    },
                );
            }
        }

        // Contracts are informational; an edge carries the stricter of
        // its two ends.
        for edge in &self.graph.edges {
            let src_key = PortKey::new(&edge.from.block, &edge.from.port, Dir::Out);
            let dst_key = PortKey::new(&edge.to.block, &edge.to.port, Dir::In);
            if let (Some(s), Some(d)) = (resolved.get(&src_key), resolved.get(&dst_key)) {
                let stricter = s.contract.stricter(d.contract);
                resolved.get_mut(&src_key).map(|t| t.contract = stricter);
                resolved.get_mut(&dst_key).map(|t| t.contract = stricter);
            }
        }

        let mut broadcast_edges = HashSet::new();
        for edge in &self.graph.edges {
            let s = resolved
                .get(&PortKey::new(&edge.from.block, &edge.from.port, Dir::Out))
                .and_then(|t| t.extent.cardinality.fixed());
            let d = resolved
                .get(&PortKey::new(&edge.to.block, &edge.to.port, Dir::In))
                .and_then(|t| t.extent.cardinality.fixed());
            match (s, d) {
                (Some(Cardinality::One), Some(Cardinality::Many(_, _))) => {
                    if self.dst_allows_broadcast(&edge.to.block) {
                        broadcast_edges.insert(edge.id.clone());
                    } else {
                        errors.push(
                            Diagnostic::new(
                                DiagKind::Type,
                                codes::CARDINALITY_MISMATCH,
                                format!("signal wired into field input without broadcast on edge {}", edge.id),
                            )
                            .at_port(edge.to.block.clone(), edge.to.port.clone()),
                        );
                    }
                }
                (Some(Cardinality::Many(_, _)), Some(Cardinality::One)) => {
                    errors.push(
                        Diagnostic::new(
                            DiagKind::Type,
                            codes::CARDINALITY_MISMATCH,
                            format!("field wired into signal input on edge {}", edge.id),
                        )
                        .at_port(edge.to.block.clone(), edge.to.port.clone()),
                    );
                }
                (Some(Cardinality::Many(i1, d1)), Some(Cardinality::Many(i2, d2))) => {
                    if d1 != d2 {
                        errors.push(
                            Diagnostic::new(
                                DiagKind::Type,
                                codes::DOMAIN_MISMATCH,
                                format!("{:?} field wired into {:?} field on edge {}", d1, d2, edge.id),
                            )
                            .at_port(edge.to.block.clone(), edge.to.port.clone()),
                        );
                    } else if i1 != i2 {
                        errors.push(
                            Diagnostic::new(
                                DiagKind::Type,
                                codes::CARDINALITY_MISMATCH,
                                format!("fields over different instances on edge {}", edge.id),
                            )
                            .at_port(edge.to.block.clone(), edge.to.port.clone()),
                        );
                    }
                }
                _ => {}
            }
        }

        (resolved, broadcast_edges)
    }
}

pub fn solve(graph: &Graph, registry: &Registry) -> Result<TypeMap, Vec<Diagnostic>> {
    TypeChecker::new(graph, registry).solve()
}
