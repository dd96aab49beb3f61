//! Integration tests for the Redis backend.
//!
//! These tests require a Redis instance, by default at `redis://127.0.0.1:6379/`
//! (override with `REDIS_URL`). They are ignored by default - run with
//! `cargo test --test redis_backend -- --ignored`

use std::sync::Arc;

use tallyman::config::StoreConfig;
use tallyman::context::{create_pool, RedisRateLimitBackendContextFactory};
use tallyman::ratelimit::{Clock, ManualClock};
use tallyman::{ContextFactory, TallymanError};
use tracing::{info_span, Span};

/// Aligned to a 60 second window boundary.
const WINDOW_START: i64 = 1_700_000_040;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
}

fn unique_prefix(test_name: &str) -> String {
    let n: u64 = rand::random();
    format!("tallyman_test:{}:{}:", test_name, n)
}

fn factory(test_name: &str, pool_size: usize) -> (RedisRateLimitBackendContextFactory, ManualClock) {
    let config = StoreConfig {
        url: redis_url(),
        pool_size,
        ..StoreConfig::default()
    };
    let pool = create_pool(&config).expect("Failed to create redis pool");
    let clock = ManualClock::new(WINDOW_START);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());

    (
        RedisRateLimitBackendContextFactory::with_prefix(pool, unique_prefix(test_name))
            .with_clock(shared),
        clock,
    )
}

/// Read the raw counter and its TTL straight from Redis.
async fn inspect(key: &str) -> (Option<i64>, i64) {
    let client = redis::Client::open(redis_url()).unwrap();
    let mut connection = client.get_multiplexed_async_connection().await.unwrap();

    let value: Option<i64> = redis::cmd("GET")
        .arg(key)
        .query_async(&mut connection)
        .await
        .unwrap();
    let ttl: i64 = redis::cmd("TTL")
        .arg(key)
        .query_async(&mut connection)
        .await
        .unwrap();
    (value, ttl)
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_window_cutover_and_reset() {
    let (factory, clock) = factory("cutover", 2);
    let limiter = factory.new_backend("ratelimit", &Span::none()).await.unwrap();

    let mut decisions = Vec::new();
    for _ in 0..4 {
        decisions.push(limiter.consume("user:123", 3, 10, 60).await.unwrap());
        clock.advance(10);
    }
    assert_eq!(decisions, vec![true, true, true, false]);

    clock.set(WINDOW_START + 61);
    assert!(limiter.consume("user:123", 3, 10, 60).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_ttl_is_twice_the_interval_and_reset_on_write() {
    let (factory, _clock) = factory("ttl", 1);
    let limiter = factory.new_backend("ratelimit", &Span::none()).await.unwrap();

    limiter.consume("k", 1, 10, 30).await.unwrap();
    let key = limiter.storage_key("k", 30).unwrap();

    let (value, ttl) = inspect(&key).await;
    assert_eq!(value, Some(1));
    assert!(ttl > 58 && ttl <= 60, "ttl was {}", ttl);

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    let (_, aged) = inspect(&key).await;
    assert!(aged <= 58, "ttl was {} after waiting", aged);

    limiter.consume("k", 1, 10, 30).await.unwrap();
    let (value, ttl) = inspect(&key).await;
    assert_eq!(value, Some(2));
    assert!(ttl > 58 && ttl <= 60, "ttl was {} after second write", ttl);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_refund_cannot_go_negative() {
    let (factory, _clock) = factory("refund", 1);
    let limiter = factory.new_backend("ratelimit", &Span::none()).await.unwrap();

    limiter.consume("k", 2, 10, 60).await.unwrap();
    assert_eq!(limiter.refund("k", 1, 60).await.unwrap(), 1);

    let err = limiter.refund("k", 5, 60).await.unwrap_err();
    assert!(matches!(err, TallymanError::NegativeCounter { current: 1, .. }));

    let (value, _) = inspect(&limiter.storage_key("k", 60).unwrap()).await;
    assert_eq!(value, Some(1));
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_limiters_per_request_share_counts() {
    let (factory, _clock) = factory("shared", 2);

    let first = factory
        .make_object_for_context("ratelimit", &info_span!("request", id = 1))
        .await
        .unwrap();
    let second = factory
        .make_object_for_context("ratelimit", &info_span!("request", id = 2))
        .await
        .unwrap();

    assert!(first.consume("k", 6, 10, 60).await.unwrap());
    assert!(!second.consume("k", 6, 10, 60).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_connection_returns_to_pool_on_drop() {
    let (factory, _clock) = factory("release", 1);

    for _ in 0..3 {
        let limiter = factory.new_backend("ratelimit", &Span::none()).await.unwrap();
        limiter.consume("k", 1, 10, 60).await.unwrap();
    }

    let limiter = factory.new_backend("ratelimit", &Span::none()).await.unwrap();
    assert!(limiter.consume("k", 7, 10, 60).await.unwrap());
    assert!(!limiter.consume("k", 1, 10, 60).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires Redis
async fn test_concurrent_requests_admit_exactly_allowance() {
    let (factory, _clock) = factory("concurrent", 8);
    let factory = Arc::new(factory);

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let factory = factory.clone();
            tokio::spawn(async move {
                let limiter = factory.new_backend("ratelimit", &Span::none()).await?;
                limiter.consume("hot", 1, 20, 60).await
            })
        })
        .collect();

    let admitted = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|admitted| *admitted)
        .count();

    assert_eq!(admitted, 20);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_non_integer_value_is_protocol_error() {
    let (factory, _clock) = factory("malformed", 1);
    let limiter = factory.new_backend("ratelimit", &Span::none()).await.unwrap();
    let key = limiter.storage_key("k", 60).unwrap();

    let client = redis::Client::open(redis_url()).unwrap();
    let mut connection = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("SET")
        .arg(&key)
        .arg("not-a-number")
        .arg("EX")
        .arg(60)
        .query_async(&mut connection)
        .await
        .unwrap();

    let err = limiter.consume("k", 1, 10, 60).await.unwrap_err();
    assert!(matches!(err, TallymanError::BackendProtocolError(_)));
}
