//! Route-aware resolution of effective scope limits.

use crate::config::{RouteRule, Scope, ScopeConfig, ScopeDefaults};
use tracing::trace;

/// Resolves the effective [`ScopeConfig`] for a request path and scope by
/// layering the longest-prefix route override over the global default.
pub struct ScopeRuleResolver {
    defaults: ScopeDefaults,
    routes: Vec<RouteRule>,
}

impl ScopeRuleResolver {
    pub fn new(defaults: ScopeDefaults, routes: Vec<RouteRule>) -> Self {
        Self { defaults, routes }
    }

    /// Effective configuration for `scope` on `path`.
    ///
    /// Among all rules whose prefix matches `path`, the longest prefix
    /// wins; ties go to the first configured rule. The winning rule's
    /// override for `scope` (if any) is merged over the global default;
    /// otherwise the default applies unchanged.
    pub fn resolve(&self, path: &str, scope: Scope) -> ScopeConfig {
        let base = self.defaults.get(scope);
        match self.match_rule(path) {
            Some(rule) => match rule.overrides.get(&scope) {
                Some(ov) => {
                    trace!(prefix = %rule.prefix, %scope, "route override applied");
                    ov.merged_over(base)
                }
                None => base.clone(),
            },
            None => base.clone(),
        }
    }

    /// Longest-prefix match over the ordered rule table. Strict
    /// greater-than keeps the first rule on equal-length ties.
    fn match_rule(&self, path: &str) -> Option<&RouteRule> {
        let mut best: Option<&RouteRule> = None;
        let mut best_len = 0;
        for rule in &self.routes {
            if path.starts_with(&rule.prefix) && rule.prefix.len() > best_len {
                best_len = rule.prefix.len();
                best = Some(rule);
            }
        }
        best
    }
}
