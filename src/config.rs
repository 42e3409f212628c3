use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// An independent limiting dimension. Each scope owns its own bucket
/// keyspace in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Tenant,
    Ip,
    Route,
}

impl Scope {
    /// Fixed evaluation order. Tests assert on token consumption of
    /// earlier scopes when a later one denies, so this order is part of
    /// the observable contract.
    pub const ALL: [Scope; 4] = [Scope::User, Scope::Tenant, Scope::Ip, Scope::Route];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Tenant => "tenant",
            Scope::Ip => "ip",
            Scope::Route => "route",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limiting algorithm selector. Only the token bucket is implemented by
/// this core; selecting `FixedWindow` disables enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    FixedWindow,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::TokenBucket
    }
}

/// Effective limit parameters for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub enabled: bool,
    /// Maximum burst size in tokens.
    pub capacity: u32,
    /// Refill rate in tokens per second. A limit of "200 per 60s" is
    /// expressed as `capacity = 200, rate = 200.0 / 60.0`.
    pub rate: f64,
    pub cost_per_request: u32,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            rate: 10.0,
            cost_per_request: 1,
        }
    }
}

impl ScopeConfig {
    /// Validate numeric parameters. Called by the engine before touching
    /// the store; a violation is a fail-open configuration error.
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be greater than 0".to_string());
        }
        if self.rate <= 0.0 || !self.rate.is_finite() {
            return Err("rate must be a positive finite number".to_string());
        }
        if self.cost_per_request == 0 {
            return Err("cost_per_request must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Partial override of a [`ScopeConfig`], carried by a route rule. Unset
/// fields inherit from the global default for the scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub cost_per_request: Option<u32>,
}

impl ScopeOverride {
    /// Layer this override over a base config: set fields win, unset
    /// fields inherit.
    pub fn merged_over(&self, base: &ScopeConfig) -> ScopeConfig {
        ScopeConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            capacity: self.capacity.unwrap_or(base.capacity),
            rate: self.rate.unwrap_or(base.rate),
            cost_per_request: self.cost_per_request.unwrap_or(base.cost_per_request),
        }
    }
}

/// A route-prefix rule overriding a subset of scopes. Rules form an
/// ordered table; the longest matching prefix wins per scope, with ties
/// broken by configuration order (first wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    #[serde(default)]
    pub overrides: HashMap<Scope, ScopeOverride>,
}

/// Global per-scope defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeDefaults {
    #[serde(default)]
    pub user: ScopeConfig,
    #[serde(default)]
    pub tenant: ScopeConfig,
    #[serde(default)]
    pub ip: ScopeConfig,
    #[serde(default)]
    pub route: ScopeConfig,
}

impl ScopeDefaults {
    pub fn get(&self, scope: Scope) -> &ScopeConfig {
        match scope {
            Scope::User => &self.user,
            Scope::Tenant => &self.tenant,
            Scope::Ip => &self.ip,
            Scope::Route => &self.route,
        }
    }
}

/// Static allow-lists. Membership disables the matching dimension for the
/// current request only; other dimensions still apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Whitelist {
    #[serde(default)]
    pub ips: HashSet<String>,
    #[serde(default)]
    pub users: HashSet<i64>,
    #[serde(default)]
    pub tenants: HashSet<i64>,
}

/// Full configuration surface consumed by the engine. Loaded once by the
/// embedding process and immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Global kill switch. When false the engine allows everything
    /// without touching the store.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Environment tag baked into every bucket key, so staging and
    /// production traffic never share counters.
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub scopes: ScopeDefaults,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub whitelist: Whitelist,
}

fn default_enabled() -> bool {
    true
}

fn default_env() -> String {
    "dev".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: Algorithm::default(),
            env: default_env(),
            scopes: ScopeDefaults::default(),
            routes: Vec::new(),
            whitelist: Whitelist::default(),
        }
    }
}
