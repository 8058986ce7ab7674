use std::io;

/// Errors surfaced by map operations.
///
/// `Corruption` is terminal: once the engine observes a broken chain or an
/// impossible rehash assignment it marks the map poisoned and refuses every
/// subsequent operation.
#[derive(Debug, thiserror::Error)]
pub enum ChainMapError {
    /// An underlying file read, write, grow or map operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk structure violates an invariant.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A typed key or value failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ChainMapError>;
