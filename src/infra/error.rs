//! Error types for the document sequencer infrastructure

use thiserror::Error;
use uuid::Uuid;

use crate::domain::DefinitionError;

use super::retry::is_retryable_db_error;

/// Errors that can occur while administering or allocating sequences
#[derive(Error, Debug)]
pub enum SequencerError {
    /// Malformed configuration; fix the input
    #[error("validation error: {0}")]
    Validation(String),

    /// An active definition already exists for the pair
    #[error("sequence definition already exists: {tenant_id}/{document_type}")]
    Conflict {
        tenant_id: Uuid,
        document_type: String,
    },

    /// Unknown or deleted definition
    #[error("sequence definition not found: {0}")]
    NotFound(String),

    /// Row lock not acquired within the wait budget
    #[error("timed out after {waited_ms}ms waiting for sequence lock on {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Durable write failed; nothing was committed
    #[error("failed to persist sequence counter: {0}")]
    PersistenceFailure(String),

    /// Counter cannot advance without overflowing storage
    #[error("counter exhausted: {0}")]
    CounterExhausted(String),

    /// Database error outside the commit path
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SequencerError {
    /// Whether a caller may retry the same request with backoff.
    ///
    /// A retried allocation may consume an extra counter value but never
    /// produces a duplicate.
    pub fn is_retryable(&self) -> bool {
        match self {
            SequencerError::LockTimeout { .. } | SequencerError::PersistenceFailure(_) => true,
            SequencerError::Database(e) => is_retryable_db_error(e),
            _ => false,
        }
    }
}

impl From<DefinitionError> for SequencerError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::CounterExhausted(key) => {
                SequencerError::CounterExhausted(key.to_string())
            }
            other => SequencerError::Validation(other.to_string()),
        }
    }
}

/// Result type for sequencer operations
pub type Result<T> = std::result::Result<T, SequencerError>;
