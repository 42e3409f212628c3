use std::time::Duration;
use thiserror::Error;

/// Failure modes of the admission-control core.
///
/// None of these ever reach the caller of the decision engine; every variant
/// is resolved to an allow by the degradation policy. They exist so the
/// store boundary can report *why* it degraded.
#[derive(Debug, Error)]
pub enum LimitError {
    #[error("invalid limit configuration: {0}")]
    Config(String),

    #[error("store unavailable: {0}")]
    Store(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("script execution failed: {0}")]
    Script(String),

    #[error("malformed store response: {0}")]
    MalformedResponse(String),
}

pub type Result<T> = std::result::Result<T, LimitError>;

impl From<redis::RedisError> for LimitError {
    fn from(err: redis::RedisError) -> Self {
        LimitError::Store(err.to_string())
    }
}
