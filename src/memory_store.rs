//! In-process token bucket store.
//!
//! Runs the same lazy-refill arithmetic as the Redis script, serialized
//! by a mutex held across the whole read-refill-consume-write step.
//! Suitable for single-process deployments and for deterministic tests,
//! which inject a manual clock instead of wall time.

use crate::error::Result;
use crate::store::{bucket_ttl_secs, BucketInfo, TokenBucketStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_update: u64,
    expires_at: u64,
}

type ClockFn = dyn Fn() -> u64 + Send + Sync;

pub struct MemoryTokenBucketStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<ClockFn>,
}

impl MemoryTokenBucketStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(unix_now))
    }

    /// Use a caller-controlled clock returning whole unix seconds.
    pub fn with_clock(clock: Arc<ClockFn>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }
}

impl Default for MemoryTokenBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl TokenBucketStore for MemoryTokenBucketStore {
    async fn allow_request(
        &self,
        key: &str,
        capacity: u32,
        rate: f64,
        cost: u32,
    ) -> Result<bool> {
        let now = self.now();
        let capacity_f = f64::from(capacity);
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // An expired or absent entry is a full bucket.
        let bucket = match buckets.get(key) {
            Some(b) if b.expires_at > now => *b,
            _ => Bucket {
                tokens: capacity_f,
                last_update: now,
                expires_at: now,
            },
        };

        let elapsed = now.saturating_sub(bucket.last_update) as f64;
        let refilled = (bucket.tokens + elapsed * rate).min(capacity_f);
        let cost_f = f64::from(cost);
        let (tokens, allowed) = if refilled >= cost_f {
            (refilled - cost_f, true)
        } else {
            (refilled, false)
        };

        buckets.insert(
            key.to_string(),
            Bucket {
                tokens,
                last_update: now,
                expires_at: now.saturating_add(bucket_ttl_secs(capacity, rate)),
            },
        );
        Ok(allowed)
    }

    async fn get_info(&self, key: &str) -> Result<BucketInfo> {
        let now = self.now();
        let buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(match buckets.get(key) {
            Some(b) if b.expires_at > now => BucketInfo {
                tokens: b.tokens,
                last_update: b.last_update,
            },
            _ => BucketInfo::default(),
        })
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(buckets.remove(key).is_some())
    }
}
