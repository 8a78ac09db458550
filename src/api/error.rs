//! Failure taxonomy for source and destination calls.

use thiserror::Error;

/// Source terminal could not be read this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single destination call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unsupported symbol: {0}")]
    UnsupportedSymbol(String),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),
}

impl DestinationError {
    /// Transport-level failures are worth retrying and count against the
    /// account's circuit breaker; everything else is final for this attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DestinationError::Timeout
                | DestinationError::RateLimited(_)
                | DestinationError::Network(_)
        )
    }

    /// Short machine-friendly label used in logs and notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationError::AuthFailed(_) => "auth_failed",
            DestinationError::Rejected(_) => "rejected",
            DestinationError::UnsupportedSymbol(_) => "unsupported_symbol",
            DestinationError::NotFound(_) => "not_found",
            DestinationError::Timeout => "timeout",
            DestinationError::RateLimited(_) => "rate_limited",
            DestinationError::Network(_) => "network",
        }
    }
}

impl From<reqwest::Error> for DestinationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DestinationError::Timeout
        } else {
            DestinationError::Network(e.to_string())
        }
    }
}
