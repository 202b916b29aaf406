use thiserror::Error;

use crate::optimizer::Fingerprint;

/// Errors surfaced to callers of the engine. Messages carry enough to retry
/// or report (family, fingerprint) and never name cache keys.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("component `{component_id}` is not registered")]
    ComponentNotRegistered { component_id: String },
    #[error("computation failed for `{query_family}` (filters {fingerprint}): {reason}")]
    ComputationFailed {
        query_family: String,
        fingerprint: Fingerprint,
        reason: String,
    },
    #[error("invalid filters for `{query_family}`: {reason}")]
    InvalidFilter { query_family: String, reason: String },
}

impl EngineError {
    pub fn not_registered(component_id: impl Into<String>) -> Self {
        Self::ComponentNotRegistered {
            component_id: component_id.into(),
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::ComponentNotRegistered { .. } => "component_not_registered",
            Self::ComputationFailed { .. } => "computation_failed",
            Self::InvalidFilter { .. } => "invalid_filter",
        }
    }
}
