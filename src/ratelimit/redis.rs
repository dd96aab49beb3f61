//! Redis-backed rate limit backend.

use std::sync::LazyLock;

use async_trait::async_trait;
use redis::Script;
use tracing::trace;

use super::backend::RateLimitBackend;
use crate::context::redis::MonitoredRedisConnection;
use crate::error::{Result, TallymanError};

/// Increment and expire in one server-side step.
///
/// Refuses to take the counter below zero instead of clamping, reporting the
/// value it found.
static APPLY_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local amount = tonumber(ARGV[1])

        local current = 0
        local raw = redis.call("GET", key)
        if raw then
            current = tonumber(raw)
            if current == nil then
                return {"malformed", 0}
            end
        end

        if current + amount < 0 then
            return {"negative", current}
        end

        local count = redis.call("INCRBY", key, ARGV[1])
        redis.call("EXPIRE", key, ARGV[2])

        return {"ok", count}
    "#,
    )
});

/// A rate limit backend talking to Redis over one checked-out connection.
#[derive(Debug)]
pub struct RedisRateLimitBackend {
    connection: MonitoredRedisConnection,
}

impl RedisRateLimitBackend {
    /// Wrap a connection obtained for the current unit of work.
    pub fn new(connection: MonitoredRedisConnection) -> Self {
        Self { connection }
    }
}

/// Turn the script's `{status, value}` reply into a counter value.
fn interpret_reply(storage_key: &str, amount: i64, status: &str, value: i64) -> Result<i64> {
    match status {
        "ok" => Ok(value),
        "negative" => Err(TallymanError::NegativeCounter {
            key: storage_key.to_string(),
            current: value,
            amount,
        }),
        "malformed" => Err(TallymanError::BackendProtocolError(format!(
            "value at {} is not an integer",
            storage_key
        ))),
        other => Err(TallymanError::BackendProtocolError(format!(
            "unexpected script status {:?}",
            other
        ))),
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn apply(&self, storage_key: &str, amount: i64, ttl: u64) -> Result<i64> {
        if storage_key.is_empty() {
            return Err(TallymanError::MalformedKey(
                "storage key must not be empty".to_string(),
            ));
        }

        let mut invocation = APPLY_SCRIPT.prepare_invoke();
        invocation.key(storage_key).arg(amount).arg(ttl);

        let (status, value): (String, i64) = self
            .connection
            .invoke_script("ratelimit", &invocation)
            .await?;

        trace!(key = storage_key, amount, ttl, status = %status, value, "Applied redis increment");
        interpret_reply(storage_key, amount, &status, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_reply_yields_count() {
        assert_eq!(interpret_reply("rl:k1", 3, "ok", 9).unwrap(), 9);
    }

    #[test]
    fn test_negative_reply_reports_current_value() {
        let err = interpret_reply("rl:k1", -5, "negative", 2).unwrap_err();
        match err {
            TallymanError::NegativeCounter { key, current, amount } => {
                assert_eq!(key, "rl:k1");
                assert_eq!(current, 2);
                assert_eq!(amount, -5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_replies_are_protocol_errors() {
        assert!(matches!(
            interpret_reply("rl:k1", 1, "malformed", 0),
            Err(TallymanError::BackendProtocolError(_))
        ));
        assert!(matches!(
            interpret_reply("rl:k1", 1, "???", 0),
            Err(TallymanError::BackendProtocolError(_))
        ));
    }
}
