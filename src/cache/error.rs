use thiserror::Error;

/// Networked-tier failures never surface here: the coordinator absorbs them
/// and degrades to process-local operation.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to serialize cache value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to deserialize cache value: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("cache value compression failed: {0}")]
    Compression(#[from] std::io::Error),
}
