//! Fixed-window bucket identifiers and storage key derivation.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{Result, TallymanError};

/// Source of wall-clock time, in whole seconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in seconds.
    fn now(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time value, so a clock handed to a backend and a
/// limiter can be advanced from the test body.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock frozen at `now` seconds.
    pub fn new(now: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Index of the window that `now` falls into: `floor(now / interval)`.
pub fn bucket_id(now: i64, interval: i64) -> Result<i64> {
    if interval <= 0 {
        return Err(TallymanError::InvalidInterval(interval));
    }
    Ok(now.div_euclid(interval))
}

/// Bucket identifier for the current wall-clock window.
pub fn current_bucket(clock: &dyn Clock, interval: i64) -> Result<i64> {
    bucket_id(clock.now(), interval)
}

/// Concatenate prefix, logical key and bucket into the key the store sees.
pub fn storage_key(prefix: &str, key: &str, bucket: i64) -> String {
    format!("{}{}{}", prefix, key, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_window_same_bucket() {
        assert_eq!(bucket_id(120, 60).unwrap(), 2);
        assert_eq!(bucket_id(179, 60).unwrap(), 2);
        assert_ne!(bucket_id(179, 60).unwrap(), bucket_id(180, 60).unwrap());
    }

    #[test]
    fn test_non_positive_interval_is_rejected() {
        assert!(matches!(
            bucket_id(100, 0),
            Err(TallymanError::InvalidInterval(0))
        ));
        assert!(matches!(
            bucket_id(100, -5),
            Err(TallymanError::InvalidInterval(-5))
        ));
    }

    #[test]
    fn test_current_bucket_follows_clock() {
        let clock = ManualClock::new(59);
        assert_eq!(current_bucket(&clock, 60).unwrap(), 0);

        clock.advance(1);
        assert_eq!(current_bucket(&clock, 60).unwrap(), 1);

        clock.set(3_600);
        assert_eq!(current_bucket(&clock, 3_600).unwrap(), 1);
    }

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(storage_key("rl:", "user:123", 28_000_000), "rl:user:12328000000");
    }

    #[test]
    fn test_distinct_keys_distinct_storage_keys() {
        let bucket = bucket_id(1_700_000_000, 60).unwrap();
        let a = storage_key("rl:", "user:1", bucket);
        let b = storage_key("rl:", "user:2", bucket);
        assert_ne!(a, b);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
