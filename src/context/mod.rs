//! Per-unit-of-work construction of rate limiters.
//!
//! A factory is configured once at startup and asked for a fresh object each
//! time a request (or any other unit of work) begins. The span identifies
//! the unit of work for telemetry only.

pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, Span};

use crate::error::Result;
use crate::ratelimit::{Clock, InMemoryRateLimitBackend, RateLimiter, DEFAULT_KEY_PREFIX};

pub use self::redis::{create_pool, MonitoredRedisConnection, RedisRateLimitBackendContextFactory};

/// Builds one object per unit of work.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    /// The object handed to each unit of work.
    type Object: Send;

    /// Create the object for the unit of work identified by `span`.
    async fn make_object_for_context(&self, name: &str, span: &Span) -> Result<Self::Object>;
}

/// Hands out in-memory rate limiters that all share one store.
#[derive(Debug, Clone)]
pub struct InMemoryRateLimitBackendContextFactory {
    backend: InMemoryRateLimitBackend,
    prefix: String,
}

impl InMemoryRateLimitBackendContextFactory {
    /// Create a factory over a fresh store with the default `rl:` prefix.
    pub fn new() -> Self {
        Self::with_backend(InMemoryRateLimitBackend::new(), DEFAULT_KEY_PREFIX)
    }

    /// Create a factory over an existing store.
    pub fn with_backend(backend: InMemoryRateLimitBackend, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// Create a factory over a fresh store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self::with_backend(InMemoryRateLimitBackend::with_clock(clock), prefix)
    }

    /// Get the shared store.
    pub fn backend(&self) -> &InMemoryRateLimitBackend {
        &self.backend
    }

    /// Create a limiter for the unit of work identified by `span`.
    pub fn new_backend(&self, name: &str, span: &Span) -> RateLimiter<InMemoryRateLimitBackend> {
        debug!(parent: span, client = name, "Creating in-memory rate limiter");
        RateLimiter::new(self.backend.clone())
            .with_prefix(self.prefix.clone())
            .with_clock(self.backend.clock())
    }
}

impl Default for InMemoryRateLimitBackendContextFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextFactory for InMemoryRateLimitBackendContextFactory {
    type Object = RateLimiter<InMemoryRateLimitBackend>;

    async fn make_object_for_context(&self, name: &str, span: &Span) -> Result<Self::Object> {
        Ok(self.new_backend(name, span))
    }
}
