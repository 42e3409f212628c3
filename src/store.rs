//! The atomic check-and-consume boundary.

use crate::error::Result;
use async_trait::async_trait;

/// Read-only snapshot of one bucket, for diagnostics and rate limit
/// headers. Zeroed when the key is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketInfo {
    pub tokens: f64,
    pub last_update: u64,
}

/// A backend holding token buckets that can refill and consume in one
/// indivisible step.
///
/// `allow_request` is the crux: refill-by-elapsed-time and conditional
/// consume must be serialized per key with respect to every other caller,
/// in any process. Implementations never expose read-then-write as two
/// separate calls; the Redis backend runs a single server-side script and
/// the in-memory backend holds a mutex across the whole update.
#[async_trait]
pub trait TokenBucketStore: Send + Sync {
    /// Atomically refill the bucket at `key` and try to consume `cost`
    /// tokens. Returns whether the request may proceed.
    ///
    /// An absent key is a full bucket. The key's TTL is refreshed to at
    /// least `ceil(capacity / rate) * 2` seconds on every call so a
    /// drained bucket outlives its own refill.
    async fn allow_request(&self, key: &str, capacity: u32, rate: f64, cost: u32)
        -> Result<bool>;

    /// Best-effort read of the bucket state. Absent keys yield the zeroed
    /// default.
    async fn get_info(&self, key: &str) -> Result<BucketInfo>;

    /// Delete the bucket, restoring a full bucket on next access. Returns
    /// whether a key was actually removed.
    async fn reset(&self, key: &str) -> Result<bool>;
}

/// Upper bound on bucket TTLs. A validate-passing but degenerate rate
/// (e.g. `1e-300`) would otherwise push the refill time to infinity and
/// saturate the float-to-integer cast.
pub(crate) const MAX_BUCKET_TTL_SECS: u64 = 60 * 60 * 24 * 30;

/// TTL applied to bucket keys: twice the full drain-to-full refill time,
/// never less than one second and never more than [`MAX_BUCKET_TTL_SECS`].
pub(crate) fn bucket_ttl_secs(capacity: u32, rate: f64) -> u64 {
    let refill_secs = (f64::from(capacity) / rate).ceil();
    let doubled = refill_secs * 2.0;
    if !doubled.is_finite() || doubled >= MAX_BUCKET_TTL_SECS as f64 {
        return MAX_BUCKET_TTL_SECS;
    }
    (doubled as u64).max(1)
}
