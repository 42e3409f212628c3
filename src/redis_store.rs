//! Redis-backed token bucket store.
//!
//! The whole refill-and-consume sequence runs as one server-side Lua
//! script, so concurrent callers in different processes observe a
//! serialized view of each bucket. The caller never performs a separate
//! read-then-write round trip.

use crate::error::{LimitError, Result};
use crate::store::{bucket_ttl_secs, BucketInfo, TokenBucketStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script, Value};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Lazy-refill token bucket, executed atomically on the Redis side.
///
/// KEYS[1] = bucket key; ARGV = capacity, rate, cost, now, ttl.
/// Replies with {allowed, tokens_remaining, now}. The tokens value is
/// returned as a string because a Lua number reply would be truncated to
/// an integer and lose fractional bucket state.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_update')
local tokens = tonumber(state[1])
local last_update = tonumber(state[2])
if tokens == nil or last_update == nil then
    tokens = capacity
    last_update = now
end

local elapsed = now - last_update
if elapsed < 0 then
    elapsed = 0
end

local refilled = tokens + elapsed * rate
if refilled > capacity then
    refilled = capacity
end

local allowed = 0
if refilled >= cost then
    tokens = refilled - cost
    allowed = 1
else
    tokens = refilled
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_update', now)
redis.call('EXPIRE', key, ttl)

return {allowed, tostring(tokens), now}
"#;

/// Connection settings for the Redis store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    pub url: String,
    /// Upper bound on any single store round trip. A timeout is treated
    /// like a connectivity failure and degrades fail-open upstream.
    #[serde(with = "humantime_serde", default = "default_op_timeout")]
    pub op_timeout: Duration,
}

fn default_op_timeout() -> Duration {
    Duration::from_millis(100)
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            op_timeout: default_op_timeout(),
        }
    }
}

pub struct RedisTokenBucketStore {
    connection: MultiplexedConnection,
    script: Script,
    op_timeout: Duration,
}

impl RedisTokenBucketStore {
    /// Connect and prepare the bucket script. The script is sent by SHA
    /// on each call; on a NOSCRIPT reply the full body is resubmitted
    /// once, which is the script-cache fallback the degradation policy
    /// expects.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| LimitError::Store(format!("failed to create redis client: {}", e)))?;
        let connection = tokio::time::timeout(
            config.op_timeout,
            client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| LimitError::Timeout(config.op_timeout))?
        .map_err(|e| LimitError::Store(format!("failed to connect to redis: {}", e)))?;

        Ok(Self {
            connection,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            op_timeout: config.op_timeout,
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| LimitError::Timeout(self.op_timeout))?
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Parse the `{allowed, tokens, now}` script reply.
    fn parse_reply(reply: Value) -> Result<(bool, f64)> {
        let values = match reply {
            Value::Bulk(values) => values,
            other => {
                return Err(LimitError::MalformedResponse(format!(
                    "expected array reply, got {:?}",
                    other
                )))
            }
        };
        if values.len() != 3 {
            return Err(LimitError::MalformedResponse(format!(
                "expected 3 values, got {}",
                values.len()
            )));
        }

        let allowed = match &values[0] {
            Value::Int(v) => *v == 1,
            other => {
                return Err(LimitError::MalformedResponse(format!(
                    "invalid allowed flag: {:?}",
                    other
                )))
            }
        };

        let tokens = match &values[1] {
            Value::Data(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| {
                    LimitError::MalformedResponse("unparseable token count".to_string())
                })?,
            other => {
                return Err(LimitError::MalformedResponse(format!(
                    "invalid token count: {:?}",
                    other
                )))
            }
        };

        Ok((allowed, tokens))
    }
}

#[async_trait]
impl TokenBucketStore for RedisTokenBucketStore {
    async fn allow_request(
        &self,
        key: &str,
        capacity: u32,
        rate: f64,
        cost: u32,
    ) -> Result<bool> {
        let now = Self::unix_now();
        let ttl = bucket_ttl_secs(capacity, rate);
        let mut conn = self.connection.clone();

        let reply: Value = self
            .bounded(async {
                self.script
                    .key(key)
                    .arg(capacity)
                    .arg(rate)
                    .arg(cost)
                    .arg(now)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| LimitError::Script(e.to_string()))
            })
            .await?;

        let (allowed, tokens) = Self::parse_reply(reply)?;
        debug!(key, allowed, tokens, "bucket consume");
        Ok(allowed)
    }

    async fn get_info(&self, key: &str) -> Result<BucketInfo> {
        let mut conn = self.connection.clone();
        let fields: Vec<Option<String>> = self
            .bounded(async {
                redis::cmd("HMGET")
                    .arg(key)
                    .arg("tokens")
                    .arg("last_update")
                    .query_async(&mut conn)
                    .await
                    .map_err(LimitError::from)
            })
            .await?;

        let tokens = fields
            .first()
            .and_then(|v| v.as_deref())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or_default();
        let last_update = fields
            .get(1)
            .and_then(|v| v.as_deref())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_default();

        Ok(BucketInfo {
            tokens,
            last_update,
        })
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .bounded(async {
                redis::cmd("DEL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(LimitError::from)
            })
            .await?;
        Ok(deleted > 0)
    }
}
