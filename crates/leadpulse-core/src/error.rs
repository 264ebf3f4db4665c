//! Error taxonomy shared across LeadPulse crates.

use std::time::Duration;

use thiserror::Error;

use crate::types::SequenceId;

pub type Result<T> = std::result::Result<T, LeadPulseError>;

#[derive(Debug, Error)]
pub enum LeadPulseError {
    /// Engine/process configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A sequence definition is malformed. Fails its activation only.
    #[error("sequence '{sequence_id}' is misconfigured: {reason}")]
    Configuration {
        sequence_id: SequenceId,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("score recalculation error: {0}")]
    Score(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LeadPulseError {
    pub fn configuration(sequence_id: &SequenceId, reason: impl Into<String>) -> Self {
        Self::Configuration {
            sequence_id: sequence_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed channel dispatch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// Transient failure; the coordinator re-arms the execution with backoff.
    #[error("retryable dispatch failure: {0}")]
    Retryable(String),

    /// The channel rejected the message; retrying will not help.
    #[error("permanent dispatch failure: {0}")]
    Permanent(String),

    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Permanent(_))
    }
}

impl From<LeadPulseError> for DispatchError {
    fn from(err: LeadPulseError) -> Self {
        match err {
            // Bad template/recipient data will fail the same way next time.
            LeadPulseError::Render(msg) | LeadPulseError::NotFound(msg) => {
                DispatchError::Permanent(msg)
            }
            other => DispatchError::Retryable(other.to_string()),
        }
    }
}
