//! Error taxonomy shared by every Colony crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColonyError {
    /// Malformed input rejected at submission time. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown entity or no schedulable candidate. Callers poll or ignore.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: cannot {action} process {id} in state {from}")]
    InvalidTransition {
        id: String,
        from: String,
        action: String,
    },

    /// A claim or optimistic update lost a race at the storage boundary.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ColonyError {
    pub fn invalid_transition(id: &str, from: impl ToString, action: &str) -> Self {
        Self::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            action: action.to_string(),
        }
    }

    /// Conflicts are resolved by re-reading and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ColonyError>;
