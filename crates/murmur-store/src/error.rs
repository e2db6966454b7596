#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller's expected tail id no longer matches the log.
    #[error(
        "stale write: expected previous message id {expected}, got {}",
        .actual.map_or_else(|| "none".to_string(), |id| id.to_string())
    )]
    StaleWrite { expected: i64, actual: Option<i64> },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
