//! Runtime error taxonomy. Config and database failures stay `anyhow` at the
//! application seams; everything a command or cycle can hit at runtime is
//! typed here so callers can tell "unknown id" from "actuator failed".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("irrigation zone not found: {0}")]
    UnknownZone(String),

    #[error("irrigation program not found: {0}")]
    UnknownProgram(String),

    #[error("invalid override for zone {zone}: {reason}")]
    InvalidOverride { zone: String, reason: String },

    #[error("actuator '{actuator}' failed: {source}")]
    Actuator {
        actuator: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PredicateError {
    /// A value the expression depends on has not been reported yet. Common
    /// right after startup, so it is logged as a warning.
    #[error("predicate value unavailable: {0}")]
    Unavailable(String),

    #[error("predicate evaluation failed: {0}")]
    Failed(String),
}

impl PredicateError {
    /// Log at the level matching the failure kind.
    pub fn log(&self, entity: &str) {
        match self {
            PredicateError::Unavailable(_) => tracing::warn!(entity = %entity, "{self}"),
            PredicateError::Failed(_) => tracing::error!(entity = %entity, "{self}"),
        }
    }
}
