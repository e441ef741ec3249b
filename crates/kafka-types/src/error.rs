//! Error types for kafka-types crate.

use thiserror::Error;

/// Errors raised while decoding a progress token.
///
/// A malformed token can only come from a host runtime that handed back
/// something this adapter never produced, so callers treat every variant as a
/// protocol violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OffsetError {
    #[error("invalid offset value {0}, the value cannot be divided to topic and offset")]
    InvalidOffsetFormat(String),

    #[error("invalid offset value {0}")]
    InvalidSequence(String),

    #[error("invalid partition id {0}")]
    InvalidPartitionId(String),
}

/// Result type alias for kafka-types operations.
pub type Result<T> = std::result::Result<T, OffsetError>;
