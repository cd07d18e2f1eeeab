//! Dispatcher configuration: backend preference order, per-backend timeouts and
//! display models, response cache sizing.
//!
//! Loadable from YAML or JSON:
//!
//! ```yaml
//! primary: torch
//! fallbacks: [ollama, cloud]
//! terminal: demo
//! backends:
//!   torch:  { timeout_ms: 3000, model: "llama-3.2-1b" }
//!   ollama: { timeout_ms: 30000, model: "llama3", base_url: "http://localhost:11434" }
//!   cloud:  { timeout_ms: 15000, base_url: "https://example.cloudfunctions.net/chat" }
//! response_cache: { capacity: 100, ttl_ms: 3600000 }
//! ```

use crate::backend::BackendId;
use crate::cache::fingerprint;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Environment variable naming a config file to load.
pub const CONFIG_ENV: &str = "AI_RELAY_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub timeout_ms: Option<u64>,
    /// Display name reported in response metadata.
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl BackendSettings {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms: Some(timeout_ms),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseCacheConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            capacity: fingerprint::DEFAULT_CAPACITY,
            ttl_ms: fingerprint::DEFAULT_TTL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub primary: Option<BackendId>,
    pub fallbacks: Vec<BackendId>,
    /// Always-available backend; forced to the end of every attempt order.
    pub terminal: BackendId,
    pub backends: BTreeMap<BackendId, BackendSettings>,
    pub response_cache: ResponseCacheConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            primary: None,
            fallbacks: Vec::new(),
            terminal: BackendId::Demo,
            backends: BTreeMap::new(),
            response_cache: ResponseCacheConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_primary(mut self, id: BackendId) -> Self {
        self.primary = Some(id);
        self
    }

    pub fn with_fallbacks(mut self, ids: impl IntoIterator<Item = BackendId>) -> Self {
        self.fallbacks = ids.into_iter().collect();
        self
    }

    pub fn with_terminal(mut self, id: BackendId) -> Self {
        self.terminal = id;
        self
    }

    pub fn with_backend(mut self, id: BackendId, settings: BackendSettings) -> Self {
        self.backends.insert(id, settings);
        self
    }

    pub fn with_response_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.response_cache = ResponseCacheConfig {
            capacity,
            ttl_ms: ttl.as_millis() as u64,
        };
        self
    }

    /// `[primary?, ...fallbacks, terminal]`, first occurrence wins, terminal exactly
    /// once and last.
    pub fn attempt_order(&self) -> Vec<BackendId> {
        let mut order: Vec<BackendId> = Vec::with_capacity(self.fallbacks.len() + 2);
        for id in self.primary.iter().chain(self.fallbacks.iter()) {
            if *id != self.terminal && !order.contains(id) {
                order.push(*id);
            }
        }
        order.push(self.terminal);
        order
    }

    pub fn timeout_for(&self, id: BackendId) -> Duration {
        let ms = self
            .backends
            .get(&id)
            .and_then(|s| s.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Duration::from_millis(ms)
    }

    pub fn model_for(&self, id: BackendId) -> Option<&str> {
        self.backends.get(&id).and_then(|s| s.model.as_deref())
    }

    pub fn base_url_for(&self, id: BackendId) -> Option<&str> {
        self.backends.get(&id).and_then(|s| s.base_url.as_deref())
    }

    pub fn response_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.response_cache.ttl_ms)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("Failed to read config: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Load from the file named by `AI_RELAY_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_cache.capacity == 0 {
            return Err(Error::configuration_with_context(
                "response cache capacity must be positive",
                ErrorContext::new()
                    .with_field_path("response_cache.capacity")
                    .with_source("config_loader"),
            ));
        }
        for (id, settings) in &self.backends {
            if settings.timeout_ms == Some(0) {
                return Err(Error::configuration_with_context(
                    "timeout must be positive",
                    ErrorContext::new()
                        .with_field_path(format!("backends.{}.timeout_ms", id))
                        .with_source("config_loader"),
                ));
            }
            if let Some(raw) = &settings.base_url {
                Url::parse(raw).map_err(|e| {
                    Error::configuration_with_context(
                        format!("invalid base_url: {}", e),
                        ErrorContext::new()
                            .with_field_path(format!("backends.{}.base_url", id))
                            .with_details(raw.clone())
                            .with_source("config_loader"),
                    )
                })?;
            }
        }
        Ok(())
    }
}
