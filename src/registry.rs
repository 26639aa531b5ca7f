// Block definitions and the registry that owns them.
//
// A block definition is pure data plus a lowering hook. The registry
// is an explicit value constructed once at program start and passed
// through the compiler; nothing in this crate registers blocks by
// import side-effect. Registration is validated eagerly so every
// lookup afterwards is pure and infallible in shape.

use std::collections::HashMap;

use crate::diag::{codes, DiagKind, Diagnostic};
use crate::lower::{FinishCtx, LowerCtx, Lowered};
use crate::types::{Contract, Domain, Payload, PayloadSet, Temporality, Unit};

// Per-block configuration, as authored in the editor. Values are
// plain JSON; blocks read them through the typed accessors below.
pub type Config = HashMap<String, serde_json::Value>;

pub fn cfg_f64(config: &Config, key: &str) -> Option<f64> {
    config.get(key).and_then(|v| v.as_f64())
}

pub fn cfg_f64_or(config: &Config, key: &str, fallback: f64) -> f64 {
    cfg_f64(config, key).unwrap_or(fallback)
}

pub fn cfg_usize(config: &Config, key: &str) -> Option<usize> {
    config.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
}

pub fn cfg_str<'a>(config: &'a Config, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockForm {
    Primitive,
    Macro,
}

// Gates scheduler decisions: state enables state slots, render emits
// globals, io is treated as impure when fusing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    Pure,
    Identity,
    State,
    Time,
    Render,
    Io,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardinalityMode {
    Preserve,
    SignalOnly,
    FieldOnly,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LaneCoupling {
    LaneLocal,
    CrossLane,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BroadcastPolicy {
    AllowZipSig,
    DisallowSignalMix,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CardinalityInfo {
    pub mode: CardinalityMode,
    pub coupling: LaneCoupling,
    pub broadcast: BroadcastPolicy,
}

impl CardinalityInfo {
    pub fn preserve() -> CardinalityInfo {
        CardinalityInfo {
            mode: CardinalityMode::Preserve,
            coupling: LaneCoupling::LaneLocal,
            broadcast: BroadcastPolicy::AllowZipSig,
        }
    }

    pub fn signal_only() -> CardinalityInfo {
        CardinalityInfo {
            mode: CardinalityMode::SignalOnly,
            coupling: LaneCoupling::LaneLocal,
            broadcast: BroadcastPolicy::DisallowSignalMix,
        }
    }

    pub fn field_only() -> CardinalityInfo {
        CardinalityInfo {
            mode: CardinalityMode::FieldOnly,
            coupling: LaneCoupling::LaneLocal,
            broadcast: BroadcastPolicy::AllowZipSig,
        }
    }
}

// Advisory flag; the scheduler may only use it to veto fusion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Purity {
    Pure,
    Impure,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PortPayload {
    Fixed(Payload),
    // Bound by the solver; constrained through allowed_payloads.
    Generic,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortCard {
    // Follow the block's cardinality mode.
    Inherit,
    Signal,
    Field,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortType {
    pub payload: PortPayload,
    pub unit: Unit,
    pub temporality: Temporality,
    pub card: PortCard,
    pub contract: Contract,
}

impl PortType {
    pub fn fixed(payload: Payload) -> PortType {
        PortType {
            payload: PortPayload::Fixed(payload),
            unit: Unit::None,
            temporality: Temporality::Continuous,
            card: PortCard::Inherit,
            contract: Contract::None,
        }
    }

    pub fn generic() -> PortType {
        PortType {
            payload: PortPayload::Generic,
            ..PortType::fixed(Payload::Float)
        }
    }

    pub fn event() -> PortType {
        PortType {
            temporality: Temporality::Discrete,
            card: PortCard::Signal,
            ..PortType::fixed(Payload::Float)
        }
    }

    pub fn unit(mut self, unit: Unit) -> PortType {
        self.unit = unit;
        self
    }

    pub fn card(mut self, card: PortCard) -> PortType {
        self.card = card;
        self
    }

    pub fn contract(mut self, contract: Contract) -> PortType {
        self.contract = contract;
        self
    }
}

// Where an unconnected input gets its value in pass 1.
#[derive(Clone, Debug, PartialEq)]
pub enum DefaultSource {
    Const(f64),
    TimeRoot,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CardinalityConstraint {
    Any,
    Signal,
    Field,
}

#[derive(Copy, Clone, Debug)]
pub struct VarargConstraint {
    pub payloads: PayloadSet,
    pub card: CardinalityConstraint,
    pub min: usize,
    pub max: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct InputDef {
    pub ty: PortType,
    pub optional: bool,
    pub default_source: Option<DefaultSource>,
    pub default_value: Option<f64>,
    pub ui_hint: Option<&'static str>,
    pub exposed_as_port: bool,
    pub vararg: Option<VarargConstraint>,
}

impl InputDef {
    pub fn new(ty: PortType) -> InputDef {
        InputDef {
            ty,
            optional: false,
            default_source: None,
            default_value: None,
            ui_hint: None,
            exposed_as_port: true,
            vararg: None,
        }
    }

    pub fn optional(mut self) -> InputDef {
        self.optional = true;
        self
    }

    pub fn default_const(mut self, v: f64) -> InputDef {
        self.default_source = Some(DefaultSource::Const(v));
        self.default_value = Some(v);
        self
    }

    pub fn default_time(mut self) -> InputDef {
        self.default_source = Some(DefaultSource::TimeRoot);
        self
    }

    pub fn hint(mut self, hint: &'static str) -> InputDef {
        self.ui_hint = Some(hint);
        self
    }

    pub fn hidden(mut self) -> InputDef {
        self.exposed_as_port = false;
        self
    }

    pub fn vararg(mut self, constraint: VarargConstraint) -> InputDef {
        self.vararg = Some(constraint);
        self
    }

    pub fn is_vararg(&self) -> bool {
        self.vararg.is_some()
    }
}

// Outputs carry only a type: a default source on an output is
// unrepresentable by construction.
#[derive(Clone, Debug)]
pub struct OutputDef {
    pub ty: PortType,
}

impl OutputDef {
    pub fn new(ty: PortType) -> OutputDef {
        OutputDef { ty }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadSemantics {
    Componentwise,
}

// Payload genericity: which payloads each generic port admits. All
// generic ports of one block bind to a single payload variable.
#[derive(Clone, Debug)]
pub struct PayloadSpec {
    pub allowed: Vec<(&'static str, PayloadSet)>,
    pub semantics: PayloadSemantics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdapterSpec {
    pub from: Unit,
    pub to: Unit,
}

// Blocks that originate a field domain declare it here; the solver
// assigns the instance id and the lowering declares the lanes. The
// lane count is the config value times count_scale (stars carry two
// control points per point).
#[derive(Copy, Clone, Debug)]
pub struct InstanceSpec {
    pub domain: Domain,
    pub count_key: &'static str,
    pub default_count: usize,
    pub count_scale: usize,
}

pub type LowerFn = fn(&mut LowerCtx) -> Result<Lowered, String>;
pub type FinishFn = fn(&mut FinishCtx) -> Result<(), String>;

// Macro expansion: inner blocks keyed by suffix, inner edges, and the
// mapping from the macro's ports onto inner addresses.
#[derive(Clone, Debug)]
pub struct Expansion {
    pub blocks: Vec<(String, &'static str, Config)>,
    pub edges: Vec<(String, String)>,
    pub inputs: Vec<(&'static str, String)>,
    pub outputs: Vec<(&'static str, String)>,
}

pub type ExpandFn = fn(&Config) -> Result<Expansion, String>;

#[derive(Clone)]
pub struct BlockDef {
    pub type_name: &'static str,
    pub label: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub form: BlockForm,
    pub capability: Capability,
    pub cardinality: CardinalityInfo,
    pub payload: Option<PayloadSpec>,
    pub inputs: Vec<(&'static str, InputDef)>,
    pub outputs: Vec<(&'static str, OutputDef)>,
    pub adapter: Option<AdapterSpec>,
    pub instance: Option<InstanceSpec>,
    pub lowering_purity: Option<Purity>,
    pub lower: LowerFn,
    pub finish: Option<FinishFn>,
    pub expand: Option<ExpandFn>,
}

impl BlockDef {
    pub fn new(type_name: &'static str, lower: LowerFn) -> BlockDef {
        BlockDef {
            type_name,
            label: type_name,
            category: "misc",
            description: "",
            form: BlockForm::Primitive,
            capability: Capability::Pure,
            cardinality: CardinalityInfo::preserve(),
            payload: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            adapter: None,
            instance: None,
            lowering_purity: None,
            lower,
            finish: None,
            expand: None,
        }
    }

    pub fn label(mut self, label: &'static str) -> BlockDef {
        self.label = label;
        self
    }

    pub fn category(mut self, category: &'static str) -> BlockDef {
        self.category = category;
        self
    }

    pub fn description(mut self, description: &'static str) -> BlockDef {
        self.description = description;
        self
    }

    pub fn capability(mut self, capability: Capability) -> BlockDef {
        self.capability = capability;
        self
    }

    pub fn cardinality(mut self, cardinality: CardinalityInfo) -> BlockDef {
        self.cardinality = cardinality;
        self
    }

    pub fn payload_spec(mut self, spec: PayloadSpec) -> BlockDef {
        self.payload = Some(spec);
        self
    }

    pub fn input(mut self, name: &'static str, def: InputDef) -> BlockDef {
        self.inputs.push((name, def));
        self
    }

    pub fn output(mut self, name: &'static str, def: OutputDef) -> BlockDef {
        self.outputs.push((name, def));
        self
    }

    pub fn adapter(mut self, spec: AdapterSpec) -> BlockDef {
        self.adapter = Some(spec);
        self
    }

    pub fn instance_spec(mut self, spec: InstanceSpec) -> BlockDef {
        self.instance = Some(spec);
        self
    }

    pub fn purity(mut self, purity: Purity) -> BlockDef {
        self.lowering_purity = Some(purity);
        self
    }

    pub fn finish_with(mut self, finish: FinishFn) -> BlockDef {
        self.finish = Some(finish);
        self
    }

    pub fn macro_form(mut self, expand: ExpandFn) -> BlockDef {
        self.form = BlockForm::Macro;
        self.expand = Some(expand);
        self
    }

    pub fn get_input(&self, name: &str) -> Option<&InputDef> {
        self.inputs.iter().find(|(n, _)| *n == name).map(|(_, d)| d)
    }

    pub fn get_output(&self, name: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|(n, _)| *n == name).map(|(_, d)| d)
    }

    fn has_port(&self, name: &str) -> bool {
        self.get_input(name).is_some() || self.get_output(name).is_some()
    }

    // Registration-time validation. Everything here is a programming
    // error in the block definition, not in any patch.
    fn validate(&self) -> Result<(), String> {
        for (name, input) in &self.inputs {
            if input.is_vararg() && input.default_source.is_some() {
                return Err(format!("vararg input {} declares a default source", name));
            }
            match (self.cardinality.mode, input.ty.card) {
                (CardinalityMode::SignalOnly, PortCard::Field) => {
                    return Err(format!("signal-only block declares field port {}", name));
                }
                (CardinalityMode::FieldOnly, PortCard::Signal) => {
                    return Err(format!("field-only block declares signal port {}", name));
                }
                _ => {}
            }
        }
        for (name, output) in &self.outputs {
            match (self.cardinality.mode, output.ty.card) {
                (CardinalityMode::SignalOnly, PortCard::Field) => {
                    return Err(format!("signal-only block declares field port {}", name));
                }
                (CardinalityMode::FieldOnly, PortCard::Signal) => {
                    return Err(format!("field-only block declares signal port {}", name));
                }
                _ => {}
            }
        }
        if let Some(spec) = &self.payload {
            for (port, _) in &spec.allowed {
                if !self.has_port(port) {
                    return Err(format!("allowed payloads name unknown port {}", port));
                }
            }
        }
        match (self.capability, self.finish.is_some()) {
            (Capability::State, false) => {
                return Err(String::from("state block without a finish hook"));
            }
            (cap, true) if cap != Capability::State => {
                return Err(String::from("finish hook on a non-state block"));
            }
            _ => {}
        }
        match (self.form, self.expand.is_some()) {
            (BlockForm::Macro, false) => {
                return Err(String::from("macro block without an expansion"));
            }
            (BlockForm::Primitive, true) => {
                return Err(String::from("primitive block with an expansion"));
            }
            _ => {}
        }
        if let Some(spec) = &self.adapter {
            if spec.from == spec.to {
                return Err(String::from("adapter converts a unit to itself"));
            }
            if self.inputs.len() != 1 || self.outputs.len() != 1 {
                return Err(String::from("adapter must have exactly one input and output"));
            }
        }
        Ok(())
    }
}

pub struct Registry {
    defs: HashMap<&'static str, BlockDef>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            defs: HashMap::new(),
        }
    }

    // The stock set every compile uses.
    pub fn builtins() -> Registry {
        let mut reg = Registry::new();
        crate::blocks::register_all(&mut reg);
        reg
    }

    pub fn register(&mut self, def: BlockDef) -> Result<(), Diagnostic> {
        if self.defs.contains_key(def.type_name) {
            return Err(Diagnostic::new(
                DiagKind::Registry,
                codes::DUPLICATE_REGISTRATION,
                format!("block type {} is already registered", def.type_name),
            ));
        }
        self.insert(def)
    }

    // Replaces an existing definition silently.
    pub fn register_override(&mut self, def: BlockDef) -> Result<(), Diagnostic> {
        self.insert(def)
    }

    fn insert(&mut self, def: BlockDef) -> Result<(), Diagnostic> {
        def.validate().map_err(|msg| {
            Diagnostic::new(
                DiagKind::Registry,
                codes::REGISTRY_INVALID,
                format!("{}: {}", def.type_name, msg),
            )
        })?;
        self.defs.insert(def.type_name, def);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&BlockDef> {
        self.defs.get(type_name)
    }

    pub fn require(&self, type_name: &str) -> Result<&BlockDef, Diagnostic> {
        self.get(type_name).ok_or_else(|| {
            Diagnostic::new(
                DiagKind::Patch,
                codes::PATCH_VIOLATION,
                format!("unknown block type {}", type_name),
            )
        })
    }

    pub fn all_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.defs.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn types_in_category(&self, category: &str) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self
            .defs
            .values()
            .filter(|d| d.category == category)
            .map(|d| d.type_name)
            .collect();
        types.sort();
        types
    }

    // Adapter lookup for pass 2. Scanned in name order so the choice
    // is deterministic even if two adapters ever overlap.
    pub fn find_adapter(&self, from: Unit, to: Unit) -> Option<&BlockDef> {
        let mut hits: Vec<&BlockDef> = self
            .defs
            .values()
            .filter(|d| d.adapter == Some(AdapterSpec { from, to }))
            .collect();
        hits.sort_by_key(|d| d.type_name);
        hits.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::codes;

    fn noop_lower(_: &mut LowerCtx) -> Result<Lowered, String> {
        Err(String::from("unreachable in tests"))
    }

    fn minimal(name: &'static str) -> BlockDef {
        BlockDef::new(name, noop_lower)
            .output("out", OutputDef::new(PortType::fixed(Payload::Float)))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = Registry::new();
        reg.register(minimal("A")).unwrap();
        reg.register(minimal("B").category("math")).unwrap();
        assert!(reg.get("A").is_some());
        assert!(reg.get("C").is_none());
        assert_eq!(reg.all_types(), vec!["A", "B"]);
        assert_eq!(reg.types_in_category("math"), vec!["B"]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut reg = Registry::new();
        reg.register(minimal("A")).unwrap();
        let err = reg.register(minimal("A")).unwrap_err();
        assert_eq!(err.code, codes::DUPLICATE_REGISTRATION);
        reg.register_override(minimal("A")).unwrap();
    }

    #[test]
    fn test_vararg_with_default_rejected() {
        let mut reg = Registry::new();
        let def = minimal("V").input(
            "items",
            InputDef::new(PortType::fixed(Payload::Float))
                .default_const(0.0)
                .vararg(VarargConstraint {
                    payloads: Payload::Float.into(),
                    card: CardinalityConstraint::Any,
                    min: 0,
                    max: None,
                }),
        );
        let err = reg.register(def).unwrap_err();
        assert_eq!(err.code, codes::REGISTRY_INVALID);
    }

    #[test]
    fn test_cardinality_symmetry() {
        let mut reg = Registry::new();
        let def = minimal("S")
            .cardinality(CardinalityInfo::signal_only())
            .input(
                "f",
                InputDef::new(PortType::fixed(Payload::Float).card(PortCard::Field)),
            );
        assert_eq!(reg.register(def).unwrap_err().code, codes::REGISTRY_INVALID);

        let def = minimal("F")
            .cardinality(CardinalityInfo::field_only())
            .input(
                "s",
                InputDef::new(PortType::fixed(Payload::Float).card(PortCard::Signal)),
            );
        assert_eq!(reg.register(def).unwrap_err().code, codes::REGISTRY_INVALID);
    }

    #[test]
    fn test_allowed_payloads_must_name_ports() {
        let mut reg = Registry::new();
        let def = minimal("P").payload_spec(PayloadSpec {
            allowed: vec![("nope", Payload::Float.into())],
            semantics: PayloadSemantics::Componentwise,
        });
        assert_eq!(reg.register(def).unwrap_err().code, codes::REGISTRY_INVALID);
    }

    #[test]
    fn test_state_requires_finish() {
        let mut reg = Registry::new();
        let def = minimal("H").capability(Capability::State);
        assert_eq!(reg.register(def).unwrap_err().code, codes::REGISTRY_INVALID);
    }

    #[test]
    fn test_adapter_shape() {
        let mut reg = Registry::new();
        let def = minimal("X").adapter(AdapterSpec {
            from: Unit::Scalar,
            to: Unit::Scalar,
        });
        assert_eq!(reg.register(def).unwrap_err().code, codes::REGISTRY_INVALID);
    }
}
