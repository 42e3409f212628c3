//! Bucket key construction.

use crate::config::Scope;
use md5::{Digest, Md5};

/// Build the store key for one (environment, scope, identifier) bucket.
///
/// Format: `rl:{env}:{scope}:{md5_hex(identifier)}:token_bucket`. The
/// identifier is hashed to bound key length and keep raw IPs and user ids
/// out of store key listings. The format is load-bearing: existing bucket
/// data written by other processes uses the same layout.
pub fn bucket_key(env: &str, scope: Scope, identifier: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(identifier.as_bytes());
    let digest = hasher.finalize();
    format!("rl:{}:{}:{:x}:token_bucket", env, scope, digest)
}
