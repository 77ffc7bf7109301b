//! Subscriber error types

use dshare_core::Error as CoreError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the subscriber
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The dataset does not exist on its publisher (or locally, for scratch)
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operand {operand} of {expression} does not exist")]
    MissingOperand { expression: String, operand: String },

    #[error("Expression cycle: {0}")]
    ExpressionCycle(String),

    #[error("Publisher unreachable at {url}: {source}")]
    PublisherUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Publisher returned {status} for {url}: {body}")]
    Publisher { status: u16, url: String, body: String },

    #[error("Unexpected response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Unknown root: {0}")]
    UnknownRoot(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] CoreError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// Whether retrying the whole operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::PublisherUnreachable { .. } | SyncError::Feed(_) => true,
            SyncError::Publisher { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the dataset itself does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFound(_) => true,
            SyncError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<tokio_websockets::Error> for SyncError {
    fn from(e: tokio_websockets::Error) -> Self {
        SyncError::Feed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::Feed("closed".into()).is_transient());
        assert!(
            SyncError::Publisher {
                status: 503,
                url: "http://x".into(),
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !SyncError::Publisher {
                status: 400,
                url: "http://x".into(),
                body: String::new()
            }
            .is_transient()
        );
        assert!(!SyncError::NotFound("foo/a".into()).is_transient());
        assert!(SyncError::NotFound("foo/a".into()).is_not_found());
        assert!(SyncError::Store(CoreError::NotFound("foo/a".into())).is_not_found());
        assert!(
            !SyncError::MissingOperand {
                expression: "foo/la".into(),
                operand: "foo/a".into()
            }
            .is_not_found()
        );
    }
}
