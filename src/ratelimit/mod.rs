//! Rate limiting logic and backends.

mod backend;
mod bucket;
mod limiter;
mod memory;
mod redis;

pub use backend::RateLimitBackend;
pub use bucket::{bucket_id, current_bucket, storage_key, Clock, ManualClock, SystemClock};
pub use limiter::{RateLimitPolicy, RateLimiter, DEFAULT_KEY_PREFIX};
pub use memory::InMemoryRateLimitBackend;
pub use self::redis::RedisRateLimitBackend;
