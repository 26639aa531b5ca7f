// Canonical types.
//
// A canonical type is the tuple (payload, unit, extent, contract).
// Payload describes the component layout of a value, unit its
// compatibility class, extent when and how many of it exist, and
// contract an optional runtime range assertion.
//
// Any of payload, temporality, or cardinality may be an unresolved
// inference variable (Term::Var) until the type checker has run.
// After checking, every port type in the program is fully fixed.
//
// Units carry compatibility, not runtime scaling: the compiler splices
// adapter blocks where units disagree, it never rescales values itself.

use enumflags2::BitFlags;
use serde::{Deserialize, Serialize};

// The component payload of a value. Strides are fixed per payload;
// the runtime never re-derives stride from unit.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Payload {
    Float      = 0b00000001,
    Int        = 0b00000010,
    Bool       = 0b00000100,
    Vec2       = 0b00001000,
    Vec3       = 0b00010000,
    Color      = 0b00100000,
    Shape      = 0b01000000,
    Projection = 0b10000000,
}

pub type PayloadSet = BitFlags<Payload>;

// Backing store element kind for a slot holding this payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Storage {
    F32,
    F64,
    I32,
}

impl Payload {
    // Component count. Shape is opaque and not sample-lane addressable.
    pub fn stride(self) -> usize {
        match self {
            Payload::Float => 1,
            Payload::Int => 1,
            Payload::Bool => 1,
            Payload::Projection => 1,
            Payload::Vec2 => 2,
            Payload::Vec3 => 3,
            Payload::Color => 4,
            Payload::Shape => 0,
        }
    }

    pub fn storage(self) -> Storage {
        match self {
            Payload::Int | Payload::Bool => Storage::I32,
            _ => Storage::F32,
        }
    }
}

// Inference variables are identity-compared by a globally unique id
// (unique within one solve) and resolved by union-find.
pub type VarId = u32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term<T> {
    Fixed(T),
    Var(VarId),
}

impl<T: Copy> Term<T> {
    pub fn is_var(&self) -> bool {
        match self {
            Term::Var(_) => true,
            Term::Fixed(_) => false,
        }
    }

    pub fn fixed(&self) -> Option<T> {
        match self {
            Term::Fixed(v) => Some(*v),
            Term::Var(_) => None,
        }
    }
}

// Demand that an inference position has been resolved.
pub fn require_fixed<T: Copy>(t: Term<T>, role: &str) -> Result<T, TypeError> {
    match t {
        Term::Fixed(v) => Ok(v),
        Term::Var(id) => Err(TypeError::Unresolved {
            role: role.to_string(),
            var: id,
        }),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AngleUnit {
    Turns,
    Radians,
    Degrees,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    Ms,
    Seconds,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceUnit {
    World,
    Local,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpaceUnit {
    Hsl,
    Rgb,
}

// Tagged unit variant. None is a neutral element: a port that declares
// no unit interest accepts anything.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    None,
    Scalar,
    Count,
    Norm01,
    Angle(AngleUnit),
    Time(TimeUnit),
    Space(SpaceUnit),
    ColorSpace(ColorSpaceUnit),
}

impl Unit {
    // Unit compatibility: equal tags and equal substructure, with None
    // neutral on either side.
    pub fn agrees_with(self, other: Unit) -> bool {
        self == Unit::None || other == Unit::None || self == other
    }
}

// Value-range assertion attached to a payload. Ordered by strictness
// so unification can keep the stricter of two constraints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Contract {
    None,
    Wrap01,
    Clamp01,
}

impl Contract {
    pub fn stricter(self, other: Contract) -> Contract {
        self.max(other)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Temporality {
    Continuous,
    Discrete,
}

// Runtime collection of lanes. Ids are assigned deterministically in
// block-index order by the type checker; the stable string key lives
// on the InstanceDecl in the IR.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

// Logical kind of an instance. Used to reject accidental cross-domain
// zips (control-point fields never mix with user arrays).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Default,
    Control,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many(InstanceId, Domain),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub temporality: Term<Temporality>,
    pub cardinality: Term<Cardinality>,
}

impl Extent {
    pub fn signal() -> Extent {
        Extent {
            temporality: Term::Fixed(Temporality::Continuous),
            cardinality: Term::Fixed(Cardinality::One),
        }
    }

    pub fn event() -> Extent {
        Extent {
            temporality: Term::Fixed(Temporality::Discrete),
            cardinality: Term::Fixed(Cardinality::One),
        }
    }

    pub fn field(instance: InstanceId, domain: Domain) -> Extent {
        Extent {
            temporality: Term::Fixed(Temporality::Continuous),
            cardinality: Term::Fixed(Cardinality::Many(instance, domain)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonType {
    pub payload: Term<Payload>,
    pub unit: Unit,
    pub extent: Extent,
    pub contract: Contract,
}

impl CanonType {
    // Continuous signal with no unit interest.
    pub fn new(payload: Payload) -> CanonType {
        CanonType {
            payload: Term::Fixed(payload),
            unit: Unit::None,
            extent: Extent::signal(),
            contract: Contract::None,
        }
    }

    pub fn with_unit(payload: Payload, unit: Unit) -> CanonType {
        CanonType {
            unit,
            ..CanonType::new(payload)
        }
    }

    pub fn with_contract(payload: Payload, unit: Unit, contract: Contract) -> CanonType {
        CanonType {
            unit,
            contract,
            ..CanonType::new(payload)
        }
    }

    pub fn field(payload: Payload, unit: Unit, instance: InstanceId, domain: Domain) -> CanonType {
        CanonType {
            payload: Term::Fixed(payload),
            unit,
            extent: Extent::field(instance, domain),
            contract: Contract::None,
        }
    }

    // Discrete one-shot occurrence. The payload is the event's scalar
    // weight; most sources emit 1.0.
    pub fn event() -> CanonType {
        CanonType {
            payload: Term::Fixed(Payload::Float),
            unit: Unit::None,
            extent: Extent::event(),
            contract: Contract::None,
        }
    }

    // Stride of the resolved payload. Callers run after type checking,
    // where payload variables no longer exist.
    pub fn stride(&self) -> Result<usize, TypeError> {
        Ok(require_fixed(self.payload, "payload")?.stride())
    }

    pub fn is_field(&self) -> bool {
        match self.extent.cardinality {
            Term::Fixed(Cardinality::Many(_, _)) => true,
            _ => false,
        }
    }

    pub fn instance(&self) -> Option<(InstanceId, Domain)> {
        match self.extent.cardinality {
            Term::Fixed(Cardinality::Many(i, d)) => Some((i, d)),
            _ => None,
        }
    }

    // Rebind the cardinality, keeping everything else. Used when a
    // signal is broadcast into a field.
    pub fn broadcast_to(&self, instance: InstanceId, domain: Domain) -> CanonType {
        CanonType {
            extent: Extent {
                temporality: self.extent.temporality,
                cardinality: Term::Fixed(Cardinality::Many(instance, domain)),
            },
            ..*self
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeError {
    Mismatch(String),
    Unresolved { role: String, var: VarId },
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TypeError::Mismatch(msg) => write!(f, "type mismatch: {}", msg),
            TypeError::Unresolved { role, var } => {
                write!(f, "unresolved {} variable #{}", role, var)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(Payload::Float.stride(), 1);
        assert_eq!(Payload::Int.stride(), 1);
        assert_eq!(Payload::Bool.stride(), 1);
        assert_eq!(Payload::Projection.stride(), 1);
        assert_eq!(Payload::Vec2.stride(), 2);
        assert_eq!(Payload::Vec3.stride(), 3);
        assert_eq!(Payload::Color.stride(), 4);
        assert_eq!(Payload::Shape.stride(), 0);
    }

    #[test]
    fn test_storage() {
        assert_eq!(Payload::Float.storage(), Storage::F32);
        assert_eq!(Payload::Int.storage(), Storage::I32);
        assert_eq!(Payload::Bool.storage(), Storage::I32);
        assert_eq!(Payload::Color.storage(), Storage::F32);
    }

    #[test]
    fn test_unit_agreement() {
        use AngleUnit::*;
        assert!(Unit::None.agrees_with(Unit::Scalar));
        assert!(Unit::Scalar.agrees_with(Unit::None));
        assert!(Unit::Angle(Turns).agrees_with(Unit::Angle(Turns)));
        assert!(!Unit::Angle(Turns).agrees_with(Unit::Angle(Radians)));
        assert!(!Unit::Scalar.agrees_with(Unit::Norm01));
    }

    #[test]
    fn test_contract_strictness() {
        assert_eq!(Contract::None.stricter(Contract::Clamp01), Contract::Clamp01);
        assert_eq!(Contract::Wrap01.stricter(Contract::None), Contract::Wrap01);
        assert_eq!(Contract::Wrap01.stricter(Contract::Clamp01), Contract::Clamp01);
    }

    #[test]
    fn test_require_fixed() {
        assert_eq!(require_fixed(Term::Fixed(Payload::Int), "payload"), Ok(Payload::Int));
        assert!(require_fixed::<Payload>(Term::Var(3), "payload").is_err());
    }

    #[test]
    fn test_payload_sets() {
        let numeric = Payload::Float | Payload::Int;
        assert!(numeric.contains(Payload::Float));
        assert!(!numeric.contains(Payload::Vec2));
    }

    #[test]
    fn test_broadcast_keeps_payload() {
        let sig = CanonType::with_unit(Payload::Vec2, Unit::Space(SpaceUnit::World));
        let field = sig.broadcast_to(InstanceId(0), Domain::Default);
        assert!(field.is_field());
        assert_eq!(field.payload, sig.payload);
        assert_eq!(field.unit, sig.unit);
    }
}
