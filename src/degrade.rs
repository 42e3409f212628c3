//! Fail-open degradation.
//!
//! Rate limiting is a protective layer, not a correctness-critical one:
//! when the store is unreachable, a script misbehaves, or a limit is
//! misconfigured, the request proceeds and the failure is logged loudly
//! enough to alert on.

use crate::config::Scope;
use crate::error::LimitError;
use tracing::warn;

/// Map an internal failure to an allow, logging the degradation at
/// warning level with enough context to be alertable.
pub fn fail_open(scope: Scope, key: &str, err: &LimitError) -> bool {
    warn!(
        %scope,
        key,
        reason = %err,
        "rate limit degraded, failing open"
    );
    true
}
