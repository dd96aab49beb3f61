//! Backend trait abstracting the counter store behind the rate limiter.

use async_trait::async_trait;

use crate::error::Result;

/// A store that can atomically increment a counter and (re-)attach a TTL.
///
/// Implementations must apply the increment and the expiry as one unit per
/// `storage_key`: concurrent callers never observe a partial apply and never
/// lose each other's updates. Errors are reported as-is, never clamped.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Add `amount` (possibly negative) to the counter at `storage_key`,
    /// reset its expiry to `ttl` seconds from now, and return the new value.
    async fn apply(&self, storage_key: &str, amount: i64, ttl: u64) -> Result<i64>;
}

#[async_trait]
impl<B: RateLimitBackend + ?Sized> RateLimitBackend for Box<B> {
    async fn apply(&self, storage_key: &str, amount: i64, ttl: u64) -> Result<i64> {
        (**self).apply(storage_key, amount, ttl).await
    }
}
