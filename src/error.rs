//! Error types for strata

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for strata
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Block metadata errors
    #[error("Block meta error: {0}")]
    Meta(String),
    /// Block index failed a health check
    #[error("Index health error: {0}")]
    IndexHealth(String),
    /// Sync of bucket metadata failed
    #[error("Meta sync error: {0}")]
    Sync(String),
    /// Planning failed
    #[error("Planning error: {0}")]
    Plan(String),
    /// Compaction-level failures with context
    #[error("Compaction error: {0}")]
    Compaction(String),
    /// Repair of a broken block failed
    #[error("Repair error: {0}")]
    Repair(String),
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
