//! Static allow-list checks.

use crate::config::{Scope, Whitelist};
use crate::engine::RequestContext;

/// Checks request identifiers against the configured allow-lists. A hit
/// skips exactly one dimension; the request is still limited on every
/// other scope.
pub struct WhitelistFilter {
    whitelist: Whitelist,
}

impl WhitelistFilter {
    pub fn new(whitelist: Whitelist) -> Self {
        Self { whitelist }
    }

    /// Whether the context's identifier for `scope` is whitelisted. The
    /// route scope has no whitelist dimension and is never whitelisted.
    pub fn is_whitelisted(&self, scope: Scope, ctx: &RequestContext) -> bool {
        match scope {
            Scope::User => ctx
                .user_id
                .map_or(false, |id| self.whitelist.users.contains(&id)),
            Scope::Tenant => ctx
                .tenant_id
                .map_or(false, |id| self.whitelist.tenants.contains(&id)),
            Scope::Ip => ctx
                .ip
                .as_deref()
                .map_or(false, |ip| self.whitelist.ips.contains(ip)),
            Scope::Route => false,
        }
    }
}
