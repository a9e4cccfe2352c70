use thiserror::Error;

/// Error surface of the memory engine.
///
/// The kinds mirror the recovery policy: [`MemoryError::DataStore`] aborts
/// the operation because the caller's data would otherwise be lost, while
/// [`MemoryError::VectorStore`] and [`MemoryError::Model`] are absorbed by
/// the callers that can degrade (search falls back to the keyword path,
/// index writes mark the persona dirty for the rebuild worker).
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key conflict: {0}")]
    Conflict(String),

    #[error("data store failure: {0}")]
    DataStore(String),

    #[error("vector store failure: {0}")]
    VectorStore(String),

    #[error("model failure: {0}")]
    Model(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Stable kind slug recorded in operation-log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::DataStore(_) => "data_store",
            Self::VectorStore(_) => "vector_store",
            Self::Model(_) => "model",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::DataStore(err.to_string())
    }
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        Self::DataStore(err.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
