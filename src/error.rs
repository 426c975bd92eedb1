//! Error types for the vote synchronization engine.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the vote synchronization engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Bad input; never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Identity missing or rejected by the identity provider.
    #[error("authentication required: {0}")]
    Authentication(String),

    /// The store rejected the operation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The store is throttling this client.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    /// Transport-level failure talking to the store.
    #[error("network error: {0}")]
    Network(String),

    /// Transaction lost a race with a concurrent writer.
    #[error("transaction conflict on {key}")]
    Conflict { key: String },

    /// A single store attempt exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker is open; the store is not being called.
    #[error("service unavailable, retry in {retry_in:?}")]
    ServiceUnavailable { retry_in: Duration },

    /// The client has no connectivity.
    #[error("client is offline")]
    Offline,

    /// The operation was cancelled (debounce teardown, session close).
    #[error("operation cancelled")]
    Cancelled,

    /// A stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid engine configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Anything the classifier does not recognize.
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Classification of an [`Error`] used by the retry policy and by sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Permission,
    RateLimit,
    Network,
    Conflict,
    Timeout,
    ServiceUnavailable,
    Offline,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Offline => "offline",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether the resilience layer may retry an error of this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Network
                | ErrorKind::Conflict
                | ErrorKind::Timeout
                | ErrorKind::Unknown
        )
    }

    /// Whether a failure of this kind says something about store health.
    ///
    /// Only these count toward opening the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        self.is_retryable()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Config(_) => ErrorKind::Validation,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Permission(_) => ErrorKind::Permission,
            Error::RateLimit { .. } => ErrorKind::RateLimit,
            Error::Network(_) => ErrorKind::Network,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Error::Offline => ErrorKind::Offline,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Serialization(_) | Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Short text suitable for showing to an end user.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "That vote could not be recorded.",
            ErrorKind::Authentication => "You must sign in to vote.",
            ErrorKind::Permission => "You are not allowed to vote on this item.",
            ErrorKind::RateLimit => "Too many votes, please slow down.",
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Conflict => {
                "Could not reach the server, please try again."
            }
            ErrorKind::ServiceUnavailable => "Voting is temporarily unavailable.",
            ErrorKind::Offline => "You are offline. Your vote will need to be resent.",
            ErrorKind::Cancelled => "",
            ErrorKind::Unknown => "Something went wrong, please try again.",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
