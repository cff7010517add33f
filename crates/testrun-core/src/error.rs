//! Core domain errors.

use thiserror::Error;

/// Core domain errors for testrun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Test file paths must be absolute.
    #[error("Test file path is not absolute: {0}")]
    RelativeTestFile(String),

    /// Shard index must be below the shard total, and the total non-zero.
    #[error("Invalid shard {index}/{total}")]
    InvalidShard { index: usize, total: usize },

    /// Unknown transport kind name.
    #[error("Unknown transport kind: {0}")]
    UnknownTransportKind(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
