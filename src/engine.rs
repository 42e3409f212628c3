//! Per-request admission decisions across limiting dimensions.

use crate::config::{Algorithm, RateLimitConfig, Scope, ScopeConfig};
use crate::degrade::fail_open;
use crate::error::LimitError;
use crate::key::bucket_key;
use crate::rules::ScopeRuleResolver;
use crate::store::TokenBucketStore;
use crate::whitelist::WhitelistFilter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity extracted from an inbound request by the embedding
/// middleware. Absent identifiers simply skip their dimension.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub user_id: Option<i64>,
    pub tenant_id: Option<i64>,
    pub ip: Option<String>,
}

/// Diagnostics for one evaluated dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScopeStatus {
    pub tokens_remaining: f64,
    /// Whole seconds until `cost` tokens will be available again. Zero
    /// when the dimension allowed the request.
    pub retry_after_secs: u64,
}

/// The outcome of one admission check. The embedding middleware turns
/// `allowed = false` into a 429-class response.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub allowed: bool,
    pub blocked_scopes: Vec<Scope>,
    pub scopes: HashMap<Scope, ScopeStatus>,
}

impl Decision {
    fn allow_all() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    /// Largest retry-after across blocked scopes, for a `Retry-After`
    /// header. `None` when the request was allowed.
    pub fn retry_after_secs(&self) -> Option<u64> {
        if self.allowed {
            return None;
        }
        self.blocked_scopes
            .iter()
            .filter_map(|scope| self.scopes.get(scope))
            .map(|status| status.retry_after_secs)
            .max()
    }
}

/// Orchestrates whitelist checks, route-aware rule resolution, and the
/// atomic store consume for every limiting dimension of a request.
///
/// Stateless per call; the only persistent state is the buckets in the
/// store. Every internal failure resolves to an allow, so callers only
/// ever see a [`Decision`].
pub struct RateLimitEngine<S: TokenBucketStore> {
    enabled: bool,
    env: String,
    resolver: ScopeRuleResolver,
    whitelist: WhitelistFilter,
    store: Arc<S>,
}

impl<S: TokenBucketStore> RateLimitEngine<S> {
    pub fn new(config: RateLimitConfig, store: Arc<S>) -> Self {
        let mut enabled = config.enabled;
        if enabled && config.algorithm != Algorithm::TokenBucket {
            // Only the token bucket is implemented; any other selector
            // turns enforcement off rather than guessing semantics.
            warn!(algorithm = ?config.algorithm, "unsupported algorithm selected, limiting disabled");
            enabled = false;
        }
        Self {
            enabled,
            env: config.env,
            resolver: ScopeRuleResolver::new(config.scopes, config.routes),
            whitelist: WhitelistFilter::new(config.whitelist),
            store,
        }
    }

    /// Evaluate every applicable dimension and combine into one decision.
    ///
    /// Dimensions run in the fixed `Scope::ALL` order with no
    /// short-circuit: a deny on one dimension still consumes tokens from
    /// dimensions evaluated before it, and diagnostics report every
    /// blocking scope.
    pub async fn decide(&self, ctx: &RequestContext) -> Decision {
        if !self.enabled {
            return Decision::allow_all();
        }

        let mut decision = Decision::allow_all();
        for scope in Scope::ALL {
            let config = self.resolver.resolve(&ctx.path, scope);
            if !config.enabled {
                continue;
            }
            let Some(identifier) = self.identifier(scope, ctx) else {
                continue;
            };
            if self.whitelist.is_whitelisted(scope, ctx) {
                debug!(%scope, path = %ctx.path, "identifier whitelisted, scope skipped");
                continue;
            }

            let (allowed, status) = self.check_scope(scope, &identifier, &config).await;
            decision.scopes.insert(scope, status);
            if !allowed {
                decision.blocked_scopes.push(scope);
            }
        }

        decision.allowed = decision.blocked_scopes.is_empty();
        if !decision.allowed {
            debug!(path = %ctx.path, blocked = ?decision.blocked_scopes, "request denied");
        }
        decision
    }

    /// Consume from one dimension's bucket, failing open on any internal
    /// error.
    async fn check_scope(
        &self,
        scope: Scope,
        identifier: &str,
        config: &ScopeConfig,
    ) -> (bool, ScopeStatus) {
        let key = bucket_key(&self.env, scope, identifier);

        // Invalid numerics never reach the store.
        if let Err(reason) = config.validate() {
            let allowed = fail_open(scope, &key, &LimitError::Config(reason));
            return (allowed, ScopeStatus::default());
        }

        let allowed = match self
            .store
            .allow_request(&key, config.capacity, config.rate, config.cost_per_request)
            .await
        {
            Ok(allowed) => allowed,
            Err(err) => return (fail_open(scope, &key, &err), ScopeStatus::default()),
        };

        // Best-effort snapshot for diagnostics and headers.
        let info = self.store.get_info(&key).await.unwrap_or_default();
        let retry_after_secs = if allowed {
            0
        } else {
            let deficit = f64::from(config.cost_per_request) - info.tokens;
            (deficit / config.rate).ceil().max(0.0) as u64
        };

        (
            allowed,
            ScopeStatus {
                tokens_remaining: info.tokens,
                retry_after_secs,
            },
        )
    }

    fn identifier(&self, scope: Scope, ctx: &RequestContext) -> Option<String> {
        match scope {
            Scope::User => ctx.user_id.map(|id| id.to_string()),
            Scope::Tenant => ctx.tenant_id.map(|id| id.to_string()),
            Scope::Ip => ctx.ip.clone(),
            Scope::Route => Some(ctx.path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteRule, ScopeOverride, Whitelist};
    use crate::memory_store::MemoryTokenBucketStore;

    fn base_config() -> RateLimitConfig {
        let mut config = RateLimitConfig::default();
        config.env = "test".to_string();
        // generous defaults; individual tests tighten one scope
        for scope_config in [
            &mut config.scopes.user,
            &mut config.scopes.tenant,
            &mut config.scopes.ip,
            &mut config.scopes.route,
        ] {
            scope_config.capacity = 1000;
            scope_config.rate = 1000.0;
        }
        config
    }

    fn ctx() -> RequestContext {
        RequestContext {
            path: "/v1/widgets".to_string(),
            user_id: Some(101),
            tenant_id: Some(7),
            ip: Some("192.168.1.9".to_string()),
        }
    }

    fn engine(config: RateLimitConfig) -> RateLimitEngine<MemoryTokenBucketStore> {
        RateLimitEngine::new(config, Arc::new(MemoryTokenBucketStore::new()))
    }

    #[tokio::test]
    async fn test_globally_disabled_allows_without_store() {
        let mut config = base_config();
        config.enabled = false;
        let engine = engine(config);
        let decision = engine.decide(&ctx()).await;
        assert!(decision.allowed);
        assert!(decision.scopes.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_algorithm_disables_limiting() {
        let mut config = base_config();
        config.algorithm = Algorithm::FixedWindow;
        config.scopes.user.capacity = 1;
        config.scopes.user.rate = 0.001;
        let engine = engine(config);
        for _ in 0..10 {
            assert!(engine.decide(&ctx()).await.allowed);
        }
    }

    #[tokio::test]
    async fn test_all_dimensions_evaluated() {
        let engine = engine(base_config());
        let decision = engine.decide(&ctx()).await;
        assert!(decision.allowed);
        assert_eq!(decision.scopes.len(), 4);
        for scope in Scope::ALL {
            assert!(decision.scopes.contains_key(&scope), "missing {}", scope);
        }
    }

    #[tokio::test]
    async fn test_absent_identifiers_skip_their_dimension() {
        let engine = engine(base_config());
        let anonymous = RequestContext {
            path: "/v1/widgets".to_string(),
            ..Default::default()
        };
        let decision = engine.decide(&anonymous).await;
        assert!(decision.allowed);
        // only the route dimension has an identifier
        assert_eq!(decision.scopes.len(), 1);
        assert!(decision.scopes.contains_key(&Scope::Route));
    }

    #[tokio::test]
    async fn test_exhausted_scope_denies_and_reports() {
        let mut config = base_config();
        config.scopes.user.capacity = 2;
        config.scopes.user.rate = 0.001;
        let engine = engine(config);
        assert!(engine.decide(&ctx()).await.allowed);
        assert!(engine.decide(&ctx()).await.allowed);
        let denied = engine.decide(&ctx()).await;
        assert!(!denied.allowed);
        assert_eq!(denied.blocked_scopes, vec![Scope::User]);
        assert!(denied.retry_after_secs().unwrap() >= 1);
        // the other dimensions were still evaluated
        assert_eq!(denied.scopes.len(), 4);
    }

    #[tokio::test]
    async fn test_deny_consumes_from_other_dimensions() {
        let mut config = base_config();
        config.scopes.user.capacity = 1;
        config.scopes.user.rate = 0.001;
        config.scopes.tenant.rate = 0.001;
        let engine = engine(config);
        engine.decide(&ctx()).await;
        let denied = engine.decide(&ctx()).await;
        assert!(!denied.allowed);
        // tenant was evaluated after user denied, so its bucket paid twice
        let tenant = denied.scopes.get(&Scope::Tenant).unwrap();
        assert!(
            tenant.tokens_remaining >= 998.0 && tenant.tokens_remaining < 998.5,
            "tokens_remaining = {}",
            tenant.tokens_remaining
        );
    }

    #[tokio::test]
    async fn test_whitelisted_ip_skips_only_ip_dimension() {
        let mut config = base_config();
        config.whitelist = Whitelist::default();
        config.whitelist.ips.insert("10.0.0.1".to_string());
        config.scopes.ip.capacity = 1;
        config.scopes.ip.rate = 0.001;
        config.scopes.user.capacity = 1;
        config.scopes.user.rate = 0.001;
        let engine = engine(config);
        let mut request = ctx();
        request.ip = Some("10.0.0.1".to_string());

        // ip would exhaust after one request, but it is whitelisted
        assert!(engine.decide(&request).await.allowed);
        let second = engine.decide(&request).await;
        assert!(!second.allowed);
        // the deny came from the user dimension, never from ip
        assert_eq!(second.blocked_scopes, vec![Scope::User]);
        assert!(!second.scopes.contains_key(&Scope::Ip));
    }

    #[tokio::test]
    async fn test_route_override_tightens_tenant_limit() {
        let mut config = base_config();
        config.scopes.tenant.capacity = 1000;
        config.scopes.tenant.rate = 1000.0 / 60.0;
        let mut overrides = HashMap::new();
        overrides.insert(
            Scope::Tenant,
            ScopeOverride {
                capacity: Some(2),
                rate: Some(0.001),
                ..Default::default()
            },
        );
        config.routes.push(RouteRule {
            prefix: "/v1/lowcode/".to_string(),
            overrides,
        });
        let engine = engine(config);

        let mut request = ctx();
        request.path = "/v1/lowcode/apps".to_string();
        assert!(engine.decide(&request).await.allowed);
        assert!(engine.decide(&request).await.allowed);
        let denied = engine.decide(&request).await;
        assert!(denied.blocked_scopes.contains(&Scope::Tenant));

        // another tenant outside the overridden route gets the generous
        // default and is nowhere near its limit
        let mut other = ctx();
        other.tenant_id = Some(8);
        let elsewhere = engine.decide(&other).await;
        assert!(elsewhere.allowed);
    }

    #[tokio::test]
    async fn test_disabled_scope_is_never_evaluated() {
        let mut config = base_config();
        config.scopes.route.enabled = false;
        let engine = engine(config);
        let decision = engine.decide(&ctx()).await;
        assert!(decision.allowed);
        assert!(!decision.scopes.contains_key(&Scope::Route));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_open_without_store() {
        let mut config = base_config();
        config.scopes.user.capacity = 0;
        let engine = engine(config);
        for _ in 0..20 {
            assert!(engine.decide(&ctx()).await.allowed);
        }
    }

    #[tokio::test]
    async fn test_retry_after_reflects_refill_rate() {
        let mut config = base_config();
        config.scopes.user.capacity = 1;
        config.scopes.user.rate = 0.5;
        let engine = engine(config);
        engine.decide(&ctx()).await;
        let denied = engine.decide(&ctx()).await;
        assert!(!denied.allowed);
        // one token at 0.5/s is up to 2 seconds away
        let retry = denied.scopes.get(&Scope::User).unwrap().retry_after_secs;
        assert!(retry >= 1 && retry <= 2, "retry_after = {}", retry);
    }
}
