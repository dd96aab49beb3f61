//! In-process counter store.
//!
//! Counters live in a sharded map; expiry is checked lazily whenever a key
//! is touched, and every few hundred applies the map is swept for windows
//! nobody will touch again. Nothing runs in the background. Clones share the
//! same map.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::backend::RateLimitBackend;
use super::bucket::{Clock, SystemClock};
use crate::error::{Result, TallymanError};

/// Applies between sweeps of expired counters.
const PURGE_EVERY: usize = 256;

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    /// Dead once `now >= expires_at`.
    expires_at: i64,
}

impl CounterEntry {
    fn live_value(&self, now: i64) -> i64 {
        if now >= self.expires_at {
            0
        } else {
            self.value
        }
    }
}

/// Rate limit backend that keeps counters in memory.
///
/// Suitable for tests and single-process deployments. Atomicity per key comes
/// from the shard lock held by the map entry for the duration of an apply.
#[derive(Debug, Clone)]
pub struct InMemoryRateLimitBackend {
    counters: Arc<DashMap<String, CounterEntry>>,
    applies: Arc<AtomicUsize>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimitBackend {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            applies: Arc::new(AtomicUsize::new(0)),
            clock,
        }
    }

    /// Get the clock expiry is measured against.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Current value at `storage_key`, or `None` if absent or expired.
    pub fn peek(&self, storage_key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.counters
            .get(storage_key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value)
    }

    /// Drop every expired counter and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.counters.len())
    }

    /// Number of stored counters, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters at all.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for InMemoryRateLimitBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn checked_apply(storage_key: &str, current: i64, amount: i64) -> Result<i64> {
    let value = current.checked_add(amount).ok_or_else(|| {
        TallymanError::InvalidArgument(format!(
            "applying {} to {} overflows the counter",
            amount, storage_key
        ))
    })?;

    if value < 0 {
        return Err(TallymanError::NegativeCounter {
            key: storage_key.to_string(),
            current,
            amount,
        });
    }
    Ok(value)
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimitBackend {
    async fn apply(&self, storage_key: &str, amount: i64, ttl: u64) -> Result<i64> {
        if storage_key.is_empty() {
            return Err(TallymanError::MalformedKey(
                "storage key must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let expires_at = now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX));

        let value = match self.counters.entry(storage_key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().live_value(now);
                let value = checked_apply(storage_key, current, amount)?;
                *occupied.get_mut() = CounterEntry { value, expires_at };
                value
            }
            Entry::Vacant(vacant) => {
                let value = checked_apply(storage_key, 0, amount)?;
                vacant.insert(CounterEntry { value, expires_at });
                value
            }
        };

        // The entry guard is released above; retaining while holding it
        // would deadlock on its shard.
        if self.applies.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            let purged = self.purge_expired();
            trace!(purged, remaining = self.counters.len(), "Swept expired counters");
        }

        trace!(key = storage_key, amount, ttl, value, "Applied in-memory increment");
        Ok(value)
    }
}
