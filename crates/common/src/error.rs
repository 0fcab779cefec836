//! Error types shared across the Buttercup services.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the common infrastructure layer.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Key/value store round-trip failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Filesystem operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A path was outside the node-local root
    #[error("path {0} is not under the node-local root")]
    NotNodeLocal(PathBuf),

    /// Required configuration is missing; the process cannot start
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A merge produced a file set that violates the corpus invariants
    #[error("corpus merge invariant violated: {0}")]
    MergeInvariant(String),

    /// External command could not be spawned or waited on
    #[error("command failed: {0}")]
    Command(String),

    /// Queue payload could not be decoded; the item is poison
    #[error("malformed queue payload on '{queue}': {source}")]
    MalformedPayload {
        queue: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CommonError>;
