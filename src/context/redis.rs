//! Redis connections scoped to a unit of work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use redis::{FromRedisValue, ScriptInvocation};
use tokio::sync::Mutex;
use tracing::{debug, field, info, info_span, trace, warn, Instrument, Span};

use super::ContextFactory;
use crate::config::StoreConfig;
use crate::error::{Result, TallymanError};
use crate::ratelimit::{
    Clock, RateLimiter, RedisRateLimitBackend, SystemClock, DEFAULT_KEY_PREFIX,
};

/// Build a connection pool from the store configuration.
pub fn create_pool(config: &StoreConfig) -> Result<Pool> {
    let mut settings = PoolSettings::from_url(config.url.clone());
    let mut pool_config = PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(Duration::from_millis(config.wait_timeout_ms));
    pool_config.timeouts.create = Some(Duration::from_millis(config.create_timeout_ms));
    pool_config.timeouts.recycle = Some(Duration::from_millis(config.recycle_timeout_ms));
    settings.pool = Some(pool_config);

    let pool = settings.create_pool(Some(Runtime::Tokio1))?;
    info!(
        url = %config.url,
        pool_size = config.pool_size,
        "Redis connection pool created"
    );
    Ok(pool)
}

/// A pooled connection checked out for one unit of work.
///
/// Every command runs inside a child span of the unit of work's span and
/// records its latency and outcome there. The connection goes back to the
/// pool when this value is dropped.
pub struct MonitoredRedisConnection {
    name: String,
    span: Span,
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for MonitoredRedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredRedisConnection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MonitoredRedisConnection {
    /// Check a connection out of `pool` on behalf of `span`.
    pub async fn checkout(name: &str, span: &Span, pool: &Pool) -> Result<Self> {
        let started = Instant::now();
        let connection = pool.get().await.map_err(|e| {
            warn!(parent: span, client = name, error = %e, "Failed to check out redis connection");
            TallymanError::from(e)
        })?;

        debug!(
            parent: span,
            client = name,
            wait_ms = started.elapsed().as_millis() as u64,
            "Checked out redis connection"
        );

        Ok(Self {
            name: name.to_string(),
            span: span.clone(),
            connection: Mutex::new(connection),
        })
    }

    /// Run a prepared script invocation under a monitored child span.
    pub async fn invoke_script<T>(
        &self,
        command: &str,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T>
    where
        T: FromRedisValue + Send,
    {
        let span = info_span!(
            parent: &self.span,
            "redis.command",
            client = %self.name,
            command = command,
            latency_ms = field::Empty,
            outcome = field::Empty
        );

        let started = Instant::now();
        let result: redis::RedisResult<T> = async {
            let mut connection = self.connection.lock().await;
            invocation.invoke_async(&mut *connection).await
        }
        .instrument(span.clone())
        .await;

        span.record("latency_ms", started.elapsed().as_millis() as u64);
        match &result {
            Ok(_) => {
                span.record("outcome", "ok");
            }
            Err(e) => {
                span.record("outcome", "error");
                warn!(parent: &span, error = %e, "Redis command failed");
            }
        }

        result.map_err(TallymanError::from)
    }
}

impl Drop for MonitoredRedisConnection {
    fn drop(&mut self) {
        trace!(parent: &self.span, client = %self.name, "Releasing redis connection");
    }
}

/// Hands out one Redis-backed rate limiter per unit of work.
///
/// The key prefix lets independent limiters share one Redis without their
/// keys colliding.
#[derive(Clone)]
pub struct RedisRateLimitBackendContextFactory {
    pool: Pool,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisRateLimitBackendContextFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimitBackendContextFactory")
            .field("prefix", &self.prefix)
            .field("pool", &self.pool.status())
            .finish()
    }
}

impl RedisRateLimitBackendContextFactory {
    /// Create a factory with the default `rl:` prefix.
    pub fn new(pool: Pool) -> Self {
        Self::with_prefix(pool, DEFAULT_KEY_PREFIX)
    }

    /// Create a factory whose limiters use `prefix`.
    pub fn with_prefix(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock handed to each limiter.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Check out a connection for `span` and wrap it in a rate limiter.
    pub async fn new_backend(
        &self,
        name: &str,
        span: &Span,
    ) -> Result<RateLimiter<RedisRateLimitBackend>> {
        let connection = MonitoredRedisConnection::checkout(name, span, &self.pool).await?;
        Ok(RateLimiter::new(RedisRateLimitBackend::new(connection))
            .with_prefix(self.prefix.clone())
            .with_clock(self.clock.clone()))
    }
}

#[async_trait]
impl ContextFactory for RedisRateLimitBackendContextFactory {
    type Object = RateLimiter<RedisRateLimitBackend>;

    async fn make_object_for_context(&self, name: &str, span: &Span) -> Result<Self::Object> {
        self.new_backend(name, span).await
    }
}
