//! 多后端回退调度器：按顺序尝试后端，带超时竞速、尝试记录与响应缓存。
//!
//! # Backend Dispatcher
//!
//! The dispatcher answers a chat request by trying registered backends one after
//! another, in preference order, until one succeeds.
//!
//! ## Flow
//!
//! 1. Derive a fingerprint from the latest user message and consult the response
//!    cache. A hit is returned as `local-cached` without touching any backend.
//! 2. Walk [`DispatcherConfig::attempt_order`] sequentially. Unregistered ids are
//!    skipped without a record.
//! 3. Each attempt races the backend against its configured timeout. When the timer
//!    wins the call's cancellation token fires and the call is dropped.
//! 4. The first success is recorded, cached and returned. Failures are recorded and
//!    the walk continues.
//! 5. When every id fails, [`Error::ChainExhausted`] carries the last error.
//!
//! ```rust,no_run
//! use ai_relay::backend::{BackendId, OfflineBackend};
//! use ai_relay::dispatcher::{BackendDispatcher, DispatcherConfig};
//! use ai_relay::Message;
//! use std::sync::Arc;
//!
//! # async fn run() -> ai_relay::Result<()> {
//! let dispatcher = BackendDispatcher::new(DispatcherConfig::default());
//! dispatcher.register(BackendId::Demo, Arc::new(OfflineBackend::new()));
//!
//! let out = dispatcher
//!     .send_message("user-1", &[Message::user("How do I start a budget?")], "")
//!     .await?;
//! println!("{} via {}", out.response.content, out.metadata.source);
//! # Ok(())
//! # }
//! ```
//!
//! Concurrent calls sharing a fingerprint are not coalesced; each runs the chain.

pub mod config;
pub mod stats;

pub use config::{BackendSettings, DispatcherConfig, ResponseCacheConfig, DEFAULT_TIMEOUT_MS};
pub use stats::{AttemptRecord, BackendStats};

use crate::backend::{
    Backend, BackendId, BackendReply, CloudFunctionBackend, OfflineBackend, OllamaBackend,
    ResponseSource,
};
use crate::cache::fingerprint::{fingerprint, FingerprintCache};
use crate::clock::{system_clock, Clock};
use crate::types::message::Message;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub source: ResponseSource,
    pub latency_ms: u64,
    pub cached: bool,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ResponseMetadata {
    fn cached(now_ms: u64) -> Self {
        Self {
            source: ResponseSource::LocalCached,
            latency_ms: 0,
            cached: true,
            timestamp: now_ms,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub response: BackendReply,
    pub metadata: ResponseMetadata,
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered multi-backend fallback chain.
///
/// One instance is built at startup and shared (`Arc`) by whoever sends chat
/// requests. All mutable state is private to the instance; accessors return copies.
pub struct BackendDispatcher {
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    backends: RwLock<HashMap<BackendId, Arc<dyn Backend>>>,
    stats: Mutex<HashMap<BackendId, BackendStats>>,
    attempts: Mutex<Vec<AttemptRecord>>,
    cache: Mutex<FingerprintCache<BackendReply>>,
}

impl BackendDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        let cache =
            FingerprintCache::new(config.response_cache.capacity, config.response_cache_ttl());
        Self {
            config,
            clock,
            backends: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            cache: Mutex::new(cache),
        }
    }

    /// Build a dispatcher and register the backends this crate ships: the offline
    /// responder as `demo`, plus `ollama`/`cloud` when their `base_url` is configured.
    pub fn with_default_backends(config: DispatcherConfig) -> Result<Self> {
        let dispatcher = Self::new(config);
        dispatcher.register(BackendId::Demo, Arc::new(OfflineBackend::new()));
        if let Some(url) = dispatcher.config.base_url_for(BackendId::Ollama) {
            let model = dispatcher
                .config
                .model_for(BackendId::Ollama)
                .unwrap_or("llama3")
                .to_string();
            dispatcher.register(BackendId::Ollama, Arc::new(OllamaBackend::new(url, model)?));
        }
        if let Some(url) = dispatcher.config.base_url_for(BackendId::Cloud) {
            dispatcher.register(BackendId::Cloud, Arc::new(CloudFunctionBackend::new(url)?));
        }
        Ok(dispatcher)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Register (or replace) the backend for `id`. Statistics are created on first
    /// registration and survive replacement.
    pub fn register(&self, id: BackendId, backend: Arc<dyn Backend>) {
        debug!(backend = %id, name = backend.name(), "registering backend");
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, backend);
        lock(&self.stats).entry(id).or_insert_with(|| BackendStats::new(id));
    }

    pub fn unregister(&self, id: BackendId) -> bool {
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn is_registered(&self, id: BackendId) -> bool {
        self.backend(id).is_some()
    }

    fn backend(&self, id: BackendId) -> Option<Arc<dyn Backend>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn attempt_order(&self) -> Vec<BackendId> {
        self.config.attempt_order()
    }

    /// Answer `messages` from the response cache or the first backend that succeeds.
    pub async fn send_message(
        &self,
        user_id: &str,
        messages: &[Message],
        system_prompt: &str,
    ) -> Result<DispatchResponse> {
        let request_id = Uuid::new_v4();
        let span = info_span!("dispatch", %request_id, user_id);
        self.dispatch(user_id, messages, system_prompt)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        user_id: &str,
        messages: &[Message],
        system_prompt: &str,
    ) -> Result<DispatchResponse> {
        let key = fingerprint(messages);
        let now = self.clock.now_ms();
        let cached = lock(&self.cache).lookup(&key, now);
        if let Some(response) = cached {
            debug!("response cache hit");
            return Ok(DispatchResponse {
                response,
                metadata: ResponseMetadata::cached(now),
            });
        }

        let mut last_error: Option<String> = None;
        for id in self.config.attempt_order() {
            let Some(backend) = self.backend(id) else {
                continue;
            };
            let timeout = self.config.timeout_for(id);
            let cancel = CancellationToken::new();
            let started = tokio::time::Instant::now();

            let call = backend.send_message(user_id, messages, system_prompt, cancel.clone());
            let outcome = match tokio::time::timeout(timeout, call).await {
                Ok(res) => res,
                Err(_) => {
                    cancel.cancel();
                    Err(Error::Timeout {
                        backend: id,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let now = self.clock.now_ms();

            match outcome {
                Ok(response) => {
                    self.record_success(id, latency_ms, now);
                    lock(&self.cache).insert(&key, response.clone(), now);
                    info!(backend = %id, latency_ms, "backend answered");
                    return Ok(DispatchResponse {
                        response,
                        metadata: ResponseMetadata {
                            source: ResponseSource::Backend(id),
                            latency_ms,
                            cached: false,
                            timestamp: now,
                            model: self.config.model_for(id).map(str::to_string),
                        },
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(backend = %id, latency_ms, error = %message, "backend attempt failed");
                    self.record_failure(id, latency_ms, &message, now);
                    last_error = Some(message);
                }
            }
        }

        let last_error =
            last_error.unwrap_or_else(|| "no registered backend in attempt order".to_string());
        warn!(error = %last_error, "all backends failed");
        Err(Error::ChainExhausted { last_error })
    }

    fn record_success(&self, id: BackendId, latency_ms: u64, now: u64) {
        lock(&self.attempts).push(AttemptRecord::success(id, latency_ms, now));
        lock(&self.stats)
            .entry(id)
            .or_insert_with(|| BackendStats::new(id))
            .record_success(latency_ms, now);
    }

    fn record_failure(&self, id: BackendId, latency_ms: u64, error: &str, now: u64) {
        lock(&self.attempts).push(AttemptRecord::failure(id, latency_ms, error, now));
        lock(&self.stats)
            .entry(id)
            .or_insert_with(|| BackendStats::new(id))
            .record_failure();
    }

    /// Snapshot of per-backend statistics, ordered by backend id.
    pub fn get_stats(&self) -> Vec<BackendStats> {
        let mut out: Vec<BackendStats> = lock(&self.stats).values().cloned().collect();
        out.sort_by_key(|s| s.backend_id);
        out
    }

    pub fn stats_for(&self, id: BackendId) -> Option<BackendStats> {
        lock(&self.stats).get(&id).cloned()
    }

    /// Copy of the attempt log, oldest first.
    pub fn get_attempts(&self) -> Vec<AttemptRecord> {
        lock(&self.attempts).clone()
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    pub fn clear_attempts(&self) {
        lock(&self.attempts).clear();
    }

    /// Zero every backend's counters; registrations are untouched.
    pub fn reset_stats(&self) {
        for (id, stats) in lock(&self.stats).iter_mut() {
            *stats = BackendStats::new(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;

    struct Fixed(&'static str);

    #[async_trait]
    impl Backend for Fixed {
        async fn send_message(
            &self,
            _: &str,
            _: &[Message],
            _: &str,
            _: CancellationToken,
        ) -> Result<BackendReply> {
            Ok(BackendReply::new(self.0))
        }
        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    #[test]
    fn test_register_creates_zeroed_stats() {
        let d = BackendDispatcher::new(DispatcherConfig::default());
        d.register(BackendId::Cloud, Arc::new(Fixed("x")));
        let stats = d.stats_for(BackendId::Cloud).unwrap();
        assert_eq!(stats, BackendStats::new(BackendId::Cloud));
        assert!(d.is_registered(BackendId::Cloud));
        assert!(d.unregister(BackendId::Cloud));
        assert!(!d.is_registered(BackendId::Cloud));
    }

    #[tokio::test]
    async fn test_no_registered_backend_exhausts_chain() {
        let d = BackendDispatcher::new(DispatcherConfig::default().with_primary(BackendId::Ollama));
        let err = d
            .send_message("u", &[Message::user("hi")], "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainExhausted { .. }));
        assert!(d.get_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_reset_stats_keeps_backends_and_log() {
        let clock = ManualClock::shared(1_000);
        let d = BackendDispatcher::with_clock(DispatcherConfig::default(), clock);
        d.register(BackendId::Demo, Arc::new(Fixed("ok")));
        d.send_message("u", &[Message::user("hi")], "").await.unwrap();

        d.reset_stats();
        assert_eq!(d.stats_for(BackendId::Demo).unwrap().total_attempts, 0);
        assert_eq!(d.get_attempts().len(), 1);
        assert_eq!(d.cache_len(), 1);
        assert!(d.is_registered(BackendId::Demo));

        d.clear_attempts();
        assert!(d.get_attempts().is_empty());
        assert_eq!(d.cache_len(), 1);

        d.clear_cache();
        assert_eq!(d.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_model_name_flows_into_metadata() {
        let cfg = DispatcherConfig::default()
            .with_backend(BackendId::Demo, BackendSettings::new(1000).with_model("canned-v1"));
        let d = BackendDispatcher::new(cfg);
        d.register(BackendId::Demo, Arc::new(Fixed("ok")));
        let out = d.send_message("u", &[Message::user("hi")], "").await.unwrap();
        assert_eq!(out.metadata.model.as_deref(), Some("canned-v1"));
        assert_eq!(out.metadata.source, ResponseSource::Backend(BackendId::Demo));
        assert!(!out.metadata.cached);
    }
}
