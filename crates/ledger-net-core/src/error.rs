//! Error types for ledger-net core primitives.

use thiserror::Error;

/// Errors raised while parsing or validating core values.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid subscriber id: {0:?}")]
    InvalidSubscriberId(String),

    #[error("invalid shard space: lower {lower} > upper {upper}")]
    InvalidShardSpace { lower: i64, upper: i64 },

    #[error("atom id mismatch: declared {declared}, computed {computed}")]
    AtomIdMismatch { declared: String, computed: String },

    #[error("atom has no shards")]
    AtomWithoutShards,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
