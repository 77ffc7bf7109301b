//! Error type shared by the local cache components.

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the chunk store, state tables and expression engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("Corrupt dataset {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Chunk {index} out of range for {path} ({total} chunks)")]
    ChunkOutOfRange { path: String, index: u64, total: u64 },

    #[error("Chunk {index} of {path} has not been fetched")]
    ChunkAbsent { path: String, index: u64 },

    #[error("Invalid dataset path: {0}")]
    InvalidPath(String),

    #[error("Invalid slice: {0}")]
    InvalidSlice(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the dataset does not exist locally
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
