//! Tallyman - Fixed-window distributed rate limiting
//!
//! This crate counts how much of an allowance each key has consumed in the
//! current fixed time window. Counters live in a pluggable backend: an
//! in-process map for tests and single-process use, or Redis so that many
//! processes enforce one shared limit.

pub mod config;
pub mod context;
pub mod error;
pub mod ratelimit;

pub use context::{
    ContextFactory, InMemoryRateLimitBackendContextFactory, RedisRateLimitBackendContextFactory,
};
pub use error::{Result, TallymanError};
pub use ratelimit::{RateLimitBackend, RateLimitPolicy, RateLimiter};
