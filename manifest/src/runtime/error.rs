// Errors raised by the runtime engine.
//
// Business outcomes (policy denials, guard failures, constraint violations)
// are not errors; they are returned as data in `CommandResult` and
// `WriteOutcome`.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// The IR hash does not match its recorded or expected value.
    #[error("IR provenance verification failed: expected {expected}, computed {actual}")]
    ProvenanceMismatch { expected: String, actual: String },

    /// A declared store target cannot be served by this runtime.
    #[error("store target '{target}' for entity '{entity}' is not available in this runtime")]
    StoreUnavailable { entity: String, target: String },

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unknown relationship '{relationship}' on entity '{entity}'")]
    UnknownRelationship { entity: String, relationship: String },

    #[error("unknown computed property '{property}' on entity '{entity}'")]
    UnknownComputed { entity: String, property: String },

    #[error("type error in {operation}: expected {expected}, got {actual}")]
    TypeError {
        expected: String,
        actual: String,
        operation: String,
    },

    #[error("'{0}' is not callable")]
    NotCallable(String),

    #[error("computed property cycle at '{entity}.{property}'")]
    ComputedCycle { entity: String, property: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Serialization(e.to_string())
    }
}
