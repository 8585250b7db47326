use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure reported by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("media i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no user is signed in")]
    Unauthenticated,

    #[error("transient store error: {0}")]
    TransientStore(#[from] StoreError),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Only store failures are worth retrying on the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientStore(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!Error::Unauthenticated.is_retryable());
        assert!(!Error::invalid("Cannot chat with yourself").is_retryable());
        assert!(Error::from(StoreError::NotFound("chat".to_string())).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::invalid("Cannot chat with yourself");
        assert_eq!(err.to_string(), "invalid operation: Cannot chat with yourself");
    }
}
