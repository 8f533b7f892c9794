//! Error types for phaselock

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PhaselockError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Sink failure: {0}")]
    SinkFailure(String),
    #[error("Cancelled")]
    Cancelled,
}

impl PhaselockError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PhaselockError>;
