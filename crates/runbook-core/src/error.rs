//! Error types for runbook-core.

use thiserror::Error;

use crate::cell::CellId;

/// Result type for runbook-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in runbook-core.
#[derive(Debug, Error)]
pub enum Error {
    /// No runner is attached to the notebook, so no execution context can be created.
    ///
    /// Recoverable: `OutputCoordinator::create_execution` answers this with a
    /// recovery prompt instead of propagating it.
    #[error("execution context not ready: {0}")]
    NotReady(String),

    /// Any other failure reported by the execution collaborator.
    #[error("backend error: {0}")]
    Backend(String),

    /// An output generator failed.
    #[error("output generator failed for {kind}: {message}")]
    Generator { kind: String, message: String },

    /// A will-end or end hook failed.
    #[error("execution hook failed for {cell_id}: {message}")]
    Hook { cell_id: CellId, message: String },

    /// The previous execution on a cell did not finish in time.
    #[error("previous execution of {0} did not finish in time")]
    ExecutionTimeout(CellId),

    /// Invalid operation (e.g., starting an execution twice).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is the recoverable "no runner attached" condition.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }

    /// The error message followed by a recovery hint, when one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::NotReady(_) => Some("attach a runner to the notebook and run the cell again"),
            Error::ExecutionTimeout(_) => {
                Some("end the running execution or raise `finish_timeout_ms`")
            }
            Error::Config(_) | Error::Json(_) => Some("check the configuration file"),
            _ => None,
        };
        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_for_recoverable_errors() {
        let err = Error::ExecutionTimeout(CellId::new(2));
        assert!(err.with_hint().starts_with("previous execution of cell_2"));
        assert!(err.with_hint().contains("hint:"));

        let err = Error::Backend("boom".to_string());
        assert_eq!(err.with_hint(), "backend error: boom");
    }
}
