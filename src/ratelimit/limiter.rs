//! Fixed-window rate limit decision engine.
//!
//! Every call charges the backend, admitted or not. Counting is a hard fixed
//! window, so up to twice the allowance can pass across a window boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::backend::RateLimitBackend;
use super::bucket::{self, Clock, SystemClock};
use crate::error::{Result, TallymanError};

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "rl:";

/// An allowance per interval, bound once and reused across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum cumulative amount within one window
    pub allowance: i64,
    /// Window length in seconds
    pub interval: i64,
}

impl RateLimitPolicy {
    /// Create a policy, checking the same bounds `consume` enforces.
    pub fn new(allowance: i64, interval: i64) -> Result<Self> {
        let policy = Self { allowance, interval };
        policy.validate()?;
        Ok(policy)
    }

    /// Check that the allowance is non-negative and the interval positive.
    pub fn validate(&self) -> Result<()> {
        if self.interval <= 0 {
            return Err(TallymanError::InvalidArgument(format!(
                "interval must be > 0, got {}",
                self.interval
            )));
        }
        if self.allowance < 0 {
            return Err(TallymanError::InvalidArgument(format!(
                "allowance must be >= 0, got {}",
                self.allowance
            )));
        }
        Ok(())
    }
}

/// The rate limiter: derives the window's storage key and asks the backend
/// to charge it.
///
/// Holds no counter state of its own. Any number of limiters sharing a
/// prefix and a store see each other's increments.
#[derive(Debug)]
pub struct RateLimiter<B> {
    backend: B,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl<B: RateLimitBackend> RateLimiter<B> {
    /// Create a limiter with the default `rl:` prefix and the system clock.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replace the clock used to pick the current window.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Storage key for `key` in the current window of `interval`.
    pub fn storage_key(&self, key: &str, interval: i64) -> Result<String> {
        let bucket = bucket::current_bucket(self.clock.as_ref(), interval)?;
        Ok(bucket::storage_key(&self.prefix, key, bucket))
    }

    /// Consume `amount` from `key`'s allowance for the current window.
    ///
    /// Returns `true` if the window total, including this amount, is still
    /// within `allowance`. The amount is charged either way.
    pub async fn consume(
        &self,
        key: &str,
        amount: i64,
        allowance: i64,
        interval: i64,
    ) -> Result<bool> {
        if amount < 0 {
            return Err(TallymanError::InvalidArgument(format!(
                "amount must be >= 0, got {}",
                amount
            )));
        }
        RateLimitPolicy { allowance, interval }.validate()?;

        let storage_key = self.storage_key(key, interval)?;
        let ttl = window_ttl(interval)?;

        trace!(
            key = %storage_key,
            amount,
            allowance,
            interval,
            "Consuming from rate limit bucket"
        );

        let count = self.backend.apply(&storage_key, amount, ttl).await?;
        let admitted = count <= allowance;

        if !admitted {
            debug!(
                key = %storage_key,
                count,
                allowance,
                "Rate limit exceeded"
            );
        }

        Ok(admitted)
    }

    /// Consume against a bound policy, failing with `RateLimitExceeded` when
    /// the call is not admitted.
    pub async fn enforce(&self, key: &str, amount: i64, policy: &RateLimitPolicy) -> Result<()> {
        if self
            .consume(key, amount, policy.allowance, policy.interval)
            .await?
        {
            Ok(())
        } else {
            Err(TallymanError::RateLimitExceeded {
                key: key.to_string(),
                allowance: policy.allowance,
            })
        }
    }

    /// Give back `amount` previously consumed from `key` in the current
    /// window and return the remaining count.
    ///
    /// Refunding more than the window holds fails with `NegativeCounter` and
    /// leaves the counter untouched. A refund issued after the window rolled
    /// over targets the new window.
    pub async fn refund(&self, key: &str, amount: i64, interval: i64) -> Result<i64> {
        if amount < 0 {
            return Err(TallymanError::InvalidArgument(format!(
                "refund amount must be >= 0, got {}",
                amount
            )));
        }
        if interval <= 0 {
            return Err(TallymanError::InvalidArgument(format!(
                "interval must be > 0, got {}",
                interval
            )));
        }

        let storage_key = self.storage_key(key, interval)?;
        let ttl = window_ttl(interval)?;

        trace!(key = %storage_key, amount, "Refunding rate limit bucket");
        self.backend.apply(&storage_key, -amount, ttl).await
    }
}

/// Counters outlive their window by one full interval.
fn window_ttl(interval: i64) -> Result<u64> {
    interval
        .checked_mul(2)
        .and_then(|ttl| u64::try_from(ttl).ok())
        .ok_or_else(|| {
            TallymanError::InvalidArgument(format!("interval {} is too large", interval))
        })
}
