use thiserror::Error;

pub type Result<T> = std::result::Result<T, PearlError>;

#[derive(Debug, Error)]
pub enum PearlError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no file identifier available")]
    NoneAvailable,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("peer broker error: {0}")]
    Peer(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl PearlError {
    /// Transient failures: the same call may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PearlError::Peer(_)
                | PearlError::Ledger(_)
                | PearlError::Timeout(_)
                | PearlError::Busy(_)
                | PearlError::Redis(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PearlError::Peer("down".to_string()).is_retryable());
        assert!(PearlError::Timeout("attach".to_string()).is_retryable());
        assert!(!PearlError::InvalidInput("len".to_string()).is_retryable());
        assert!(!PearlError::NoneAvailable.is_retryable());
    }
}
