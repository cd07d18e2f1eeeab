//! Cache key namespacing and the TTL policy for volatile keys.

use std::time::Duration;
use tracing::warn;

pub const DEFAULT_NAMESPACE: &str = "cache:";

/// Maps logical keys (e.g. `"b3:PETR4"`) to durable-tier keys (`"cache:b3:PETR4"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn durable_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Inverse of [`durable_key`](Self::durable_key); `None` for keys outside the namespace.
    pub fn logical_key<'a>(&self, durable: &'a str) -> Option<&'a str> {
        durable.strip_prefix(self.namespace.as_str())
    }

    pub fn owns(&self, durable: &str) -> bool {
        durable.starts_with(self.namespace.as_str())
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Decides the TTL for a write and flags explicit TTLs used outside the
/// volatile key classes they are meant for.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub default_ttl: Duration,
    pub volatile_prefixes: Vec<String>,
}

impl TtlPolicy {
    pub fn is_volatile(&self, key: &str) -> bool {
        self.volatile_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Explicit TTL wins over the default. Returns the TTL and whether the
    /// explicit value was used on a non-volatile key.
    pub fn resolve(&self, key: &str, explicit: Option<Duration>) -> (Duration, bool) {
        match explicit {
            Some(ttl) if ttl != self.default_ttl => (ttl, !self.is_volatile(key)),
            Some(ttl) => (ttl, false),
            None => (self.default_ttl, false),
        }
    }

    pub fn resolve_logged(&self, key: &str, explicit: Option<Duration>) -> Duration {
        let (ttl, flagged) = self.resolve(key, explicit);
        if flagged {
            warn!(
                key,
                ttl_ms = ttl.as_millis() as u64,
                "custom TTL used on a non-volatile cache key"
            );
        }
        ttl
    }
}
