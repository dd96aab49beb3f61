//! Error types for Tallyman.

use thiserror::Error;

/// Main error type for Tallyman operations.
#[derive(Error, Debug)]
pub enum TallymanError {
    /// A caller passed an out-of-range amount, allowance or interval.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The bucket function was asked to divide by a non-positive interval.
    #[error("Invalid interval: {0} (must be > 0)")]
    InvalidInterval(i64),

    /// The backing store could not be reached or timed out.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backing store answered with something we could not interpret.
    #[error("Backend protocol error: {0}")]
    BackendProtocolError(String),

    /// A storage key was rejected before reaching the store.
    #[error("Malformed storage key: {0}")]
    MalformedKey(String),

    /// Applying the amount would drive the counter below zero.
    #[error("Counter for {key} would go negative (current {current}, amount {amount})")]
    NegativeCounter {
        /// Storage key that was targeted
        key: String,
        /// Counter value before the rejected apply
        current: i64,
        /// Amount that was refused
        amount: i64,
    },

    /// A policy-bound consume was not admitted.
    #[error("Rate limit exceeded for {key} (allowance {allowance})")]
    RateLimitExceeded {
        /// Logical key that was limited
        key: String,
        /// Allowance of the violated policy
        allowance: i64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TallymanError {
    /// Whether a later, separate call could succeed where this one failed.
    ///
    /// Nothing in this crate retries on its own; this only informs callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TallymanError::BackendUnavailable(_) | TallymanError::BackendProtocolError(_)
        )
    }
}

impl From<redis::RedisError> for TallymanError {
    fn from(err: redis::RedisError) -> Self {
        use redis::ErrorKind;

        let unavailable = err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || matches!(
                err.kind(),
                ErrorKind::BusyLoadingError
                    | ErrorKind::TryAgain
                    | ErrorKind::ClusterDown
                    | ErrorKind::MasterDown
            );

        if unavailable {
            TallymanError::BackendUnavailable(err.to_string())
        } else {
            TallymanError::BackendProtocolError(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for TallymanError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        match err {
            deadpool_redis::PoolError::Backend(e) => e.into(),
            other => TallymanError::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<deadpool_redis::CreatePoolError> for TallymanError {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        TallymanError::Config(format!("Failed to create redis pool: {}", err))
    }
}

impl From<config::ConfigError> for TallymanError {
    fn from(err: config::ConfigError) -> Self {
        TallymanError::Config(err.to_string())
    }
}

/// Result type alias for Tallyman operations.
pub type Result<T> = std::result::Result<T, TallymanError>;
