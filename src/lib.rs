//! limitgate: distributed multi-dimensional admission control.
//!
//! A request is checked against independent token buckets for its user,
//! tenant, IP, and route, with route-prefix rule overrides, static
//! whitelists, and fail-open degradation when the shared store is
//! unavailable. Buckets live in Redis and are updated through a single
//! atomic server-side script, so concurrent workers in separate
//! processes never double-spend a token.

pub mod config;
pub mod degrade;
pub mod engine;
pub mod error;
pub mod key;
pub mod memory_store;
pub mod redis_store;
pub mod rules;
pub mod store;
pub mod whitelist;

pub use config::{
    Algorithm, RateLimitConfig, RouteRule, Scope, ScopeConfig, ScopeDefaults, ScopeOverride,
    Whitelist,
};
pub use engine::{Decision, RateLimitEngine, RequestContext, ScopeStatus};
pub use error::{LimitError, Result};
pub use key::bucket_key;
pub use memory_store::MemoryTokenBucketStore;
pub use redis_store::{RedisStoreConfig, RedisTokenBucketStore};
pub use store::{BucketInfo, TokenBucketStore};
