// Compile diagnostics.
//
// Every error the pipeline can produce is flattened into this one
// record before it reaches the caller: a coarse kind (which stage),
// a stable code (what tests and editors match against), a free-form
// message, and an optional location in the patch.

use serde::Serialize;


#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagKind {
    Registry,
    Patch,
    Default,
    Adapter,
    Vararg,
    Type,
    Lowering,
    Scheduling,
}


// Stable codes. Tests match on these strings; never rename one.
pub mod codes {
    pub const REGISTRY_INVALID: &str = "RegistryInvalid";
    pub const DUPLICATE_REGISTRATION: &str = "DuplicateRegistration";
    pub const PATCH_VIOLATION: &str = "PatchViolation";
    pub const MISSING_INPUT: &str = "MissingInput";
    pub const UNIT_MISMATCH: &str = "UnitMismatch";
    pub const INVALID_ADDRESS: &str = "InvalidAddress";
    pub const CONNECTION_LIMIT: &str = "ConnectionLimit";
    pub const TYPE_MISMATCH: &str = "TypeMismatch";
    pub const CARDINALITY_MISMATCH: &str = "CardinalityMismatch";
    pub const DOMAIN_MISMATCH: &str = "DomainMismatch";
    pub const LOWERING_FAILED: &str = "LoweringFailed";
    pub const CYCLE_DETECTED: &str = "CycleDetected";
}


#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiagWhere {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<usize>,
}


#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub code: &'static str,
    pub message: String,
    #[serde(rename = "where")]
    pub at: DiagWhere,
}


impl Diagnostic {
    pub fn new(kind: DiagKind, code: &'static str, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            kind,
            code,
            message: message.into(),
            at: DiagWhere::default(),
        }
    }

    pub fn at_block(mut self, block: impl Into<String>) -> Diagnostic {
        self.at.block = Some(block.into());
        self
    }

    pub fn at_port(mut self, block: impl Into<String>, port: impl Into<String>) -> Diagnostic {
        self.at.block = Some(block.into());
        self.at.port = Some(port.into());
        self
    }

    pub fn at_connection(mut self, index: usize) -> Diagnostic {
        self.at.connection = Some(index);
        self
    }
}


impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}/{}: {}", self.kind, self.code, self.message)?;
        if let Some(block) = &self.at.block {
            write!(f, " (at {}", block)?;
            if let Some(port) = &self.at.port {
                write!(f, ":{}", port)?;
            }
            if let Some(i) = self.at.connection {
                write!(f, "#{}", i)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
