//! Tiered read-through cache manager.

use super::key::{KeySpace, TtlPolicy, DEFAULT_NAMESPACE};
use super::store::DurableStore;
use crate::clock::{system_clock, Clock};
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub namespace: String,
    pub default_ttl: Duration,
    /// Key prefixes allowed to carry a non-default TTL (market quotes and similar).
    pub volatile_prefixes: Vec<String>,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_ttl: DEFAULT_TTL,
            volatile_prefixes: vec!["b3:".to_string()],
            enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
    pub fn with_volatile_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.volatile_prefixes.push(prefix.into());
        self
    }
}

/// Called once a background revalidation settles.
pub type BackgroundUpdate<T> = Arc<dyn Fn(Result<T>) + Send + Sync>;

/// Per-call options for the read-through strategies.
pub struct CacheOptions<T> {
    pub ttl: Option<Duration>,
    pub force_refresh: bool,
    pub on_background_update: Option<BackgroundUpdate<T>>,
}

impl<T> CacheOptions<T> {
    pub fn new() -> Self {
        Self {
            ttl: None,
            force_refresh: false,
            on_background_update: None,
        }
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
    pub fn on_background_update(mut self, f: impl Fn(Result<T>) + Send + Sync + 'static) -> Self {
        self.on_background_update = Some(Arc::new(f));
        self
    }
}

impl<T> Default for CacheOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CacheOptions<T> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            force_refresh: self.force_refresh,
            on_background_update: self.on_background_update.clone(),
        }
    }
}

/// Envelope persisted in the durable tier. Valid iff `now - timestamp < ttl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: u64,
    pub ttl: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_valid(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) < self.ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// Callers that joined an already pending fetch instead of starting one.
    pub dedup_joins: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    dedup_joins: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
        }
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<Error>>>>;

struct InFlight<T> {
    id: u64,
    fetch: SharedFetch<T>,
}

struct Inner<T> {
    config: CacheConfig,
    keys: KeySpace,
    ttl: TtlPolicy,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    memory: RwLock<HashMap<String, CacheEntry<T>>>,
    inflight: Mutex<HashMap<String, InFlight<T>>>,
    next_fetch_id: AtomicU64,
    /// Bumped by `clear()`; fetches started under an older generation are not stored.
    generation: AtomicU64,
    stats: AtomicStats,
}

fn read<V>(lock: &RwLock<V>) -> RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<V>(lock: &RwLock<V>) -> RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Inner<T> {
    fn finish_fetch(&self, key: &str, id: u64) {
        let mut inflight = lock(&self.inflight);
        if inflight.get(key).map(|f| f.id) == Some(id) {
            inflight.remove(key);
        }
    }
}

/// Read-through cache over an in-process memory tier and a [`DurableStore`].
///
/// Cloning is cheap and every clone shares the same tiers, stats and in-flight
/// registry. Keys are logical (`"b3:PETR4"`); the durable tier sees them under the
/// configured namespace (`"cache:b3:PETR4"`).
pub struct TieredCacheManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TieredCacheManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> TieredCacheManager<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig, store: Arc<dyn DurableStore>) -> Self {
        Self::with_clock(config, store, system_clock())
    }

    pub fn with_clock(
        config: CacheConfig,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = KeySpace::new(config.namespace.clone());
        let ttl = TtlPolicy {
            default_ttl: config.default_ttl,
            volatile_prefixes: config.volatile_prefixes.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                keys,
                ttl,
                store,
                clock,
                memory: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                stats: AtomicStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.to_stats()
    }

    pub fn store_name(&self) -> &'static str {
        self.inner.store.name()
    }

    pub fn memory_len(&self) -> usize {
        read(&self.inner.memory).len()
    }

    pub fn inflight_len(&self) -> usize {
        lock(&self.inner.inflight).len()
    }

    /// Return a valid cached value, or fetch (deduplicated), store and return it.
    pub async fn cache_first<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        opts: CacheOptions<T>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !opts.force_refresh {
            if let Some(cached) = self.get(key).await {
                return Ok(cached);
            }
        }
        let generation = self.generation();
        let value = self.deduped_fetch(key, fetcher).await?;
        self.store_fetched(key, value.clone(), opts.ttl, generation).await;
        Ok(value)
    }

    /// Fetch first; on failure fall back to whatever valid entry is still cached.
    pub async fn network_first<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        opts: CacheOptions<T>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let generation = self.generation();
        match self.deduped_fetch(key, fetcher).await {
            Ok(value) => {
                self.store_fetched(key, value.clone(), opts.ttl, generation).await;
                Ok(value)
            }
            Err(e) => match self.get(key).await {
                Some(cached) => {
                    warn!(key, error = %e, "fetch failed, serving cached value");
                    Ok(cached)
                }
                None => Err(e),
            },
        }
    }

    /// Serve the cached value immediately and refresh it in a detached task. Without a
    /// cached value the fetch runs in the foreground.
    pub async fn stale_while_revalidate<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        opts: CacheOptions<T>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(cached) = self.get(key).await {
            self.spawn_revalidation(key, fetcher, opts);
            return Ok(cached);
        }
        let generation = self.generation();
        match self.join_or_start(key, fetcher).await {
            Ok(value) => {
                self.store_fetched(key, value.clone(), opts.ttl, generation).await;
                Ok(value)
            }
            Err(source) => Err(Error::Fetch {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn spawn_revalidation<F, Fut>(&self, key: &str, fetcher: F, opts: CacheOptions<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        // Register before spawning so concurrent callers join this fetch.
        let generation = self.generation();
        let fetch = self.join_or_start(key, fetcher);
        let this = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match fetch.await {
                Ok(value) => {
                    this.store_fetched(&key, value.clone(), opts.ttl, generation).await;
                    debug!(key = %key, "background revalidation stored fresh value");
                    if let Some(cb) = opts.on_background_update {
                        cb(Ok(value));
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "background revalidation failed");
                    if let Some(cb) = opts.on_background_update {
                        cb(Err(Error::Shared(e)));
                    }
                }
            }
        });
    }

    /// Memory tier first, then the durable tier. Expired or unreadable durable
    /// entries are deleted.
    pub async fn get(&self, key: &str) -> Option<T> {
        if !self.inner.config.enabled {
            return None;
        }
        let now = self.inner.clock.now_ms();
        {
            let mut memory = write(&self.inner.memory);
            match memory.get(key) {
                Some(entry) if entry.is_valid(now) => {
                    AtomicStats::bump(&self.inner.stats.hits);
                    debug!(key, tier = "memory", "cache hit");
                    return Some(entry.data.clone());
                }
                Some(_) => {
                    memory.remove(key);
                }
                None => {}
            }
        }

        let durable_key = self.inner.keys.durable_key(key);
        let raw = match self.inner.store.get_item(&durable_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                AtomicStats::bump(&self.inner.stats.misses);
                return None;
            }
            Err(e) => {
                AtomicStats::bump(&self.inner.stats.errors);
                AtomicStats::bump(&self.inner.stats.misses);
                warn!(key, error = %e, "durable read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) if entry.is_valid(now) => {
                let data = entry.data.clone();
                write(&self.inner.memory).insert(key.to_string(), entry);
                AtomicStats::bump(&self.inner.stats.hits);
                debug!(key, tier = "durable", "cache hit");
                Some(data)
            }
            Ok(_) => {
                AtomicStats::bump(&self.inner.stats.misses);
                self.remove_durable(key, &durable_key).await;
                None
            }
            Err(e) => {
                AtomicStats::bump(&self.inner.stats.errors);
                AtomicStats::bump(&self.inner.stats.misses);
                warn!(key, error = %e, "discarding unreadable cache entry");
                self.remove_durable(key, &durable_key).await;
                None
            }
        }
    }

    /// Write-through with the default TTL.
    pub async fn set(&self, key: &str, value: T) {
        self.put(key, value, None).await
    }

    pub async fn set_with_ttl(&self, key: &str, value: T, ttl: Duration) {
        self.put(key, value, Some(ttl)).await
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Store a fetched value unless `clear()` ran since the fetch started.
    async fn store_fetched(&self, key: &str, value: T, ttl: Option<Duration>, generation: u64) {
        if self.generation() != generation {
            debug!(key, "dropping value fetched before clear");
            return;
        }
        self.put(key, value, ttl).await
    }

    async fn put(&self, key: &str, value: T, ttl: Option<Duration>) {
        if !self.inner.config.enabled {
            return;
        }
        let ttl = self.inner.ttl.resolve_logged(key, ttl);
        let entry = CacheEntry {
            data: value,
            timestamp: self.inner.clock.now_ms(),
            ttl: ttl.as_millis() as u64,
        };
        let encoded = serde_json::to_string(&entry);
        write(&self.inner.memory).insert(key.to_string(), entry);
        AtomicStats::bump(&self.inner.stats.sets);

        let encoded = match encoded {
            Ok(s) => s,
            Err(e) => {
                AtomicStats::bump(&self.inner.stats.errors);
                warn!(key, error = %e, "failed to encode cache entry");
                return;
            }
        };
        let durable_key = self.inner.keys.durable_key(key);
        if let Err(e) = self.inner.store.set_item(&durable_key, &encoded).await {
            AtomicStats::bump(&self.inner.stats.errors);
            warn!(key, error = %e, "durable write failed");
        }
    }

    pub async fn remove(&self, key: &str) {
        write(&self.inner.memory).remove(key);
        let durable_key = self.inner.keys.durable_key(key);
        self.remove_durable(key, &durable_key).await;
    }

    async fn remove_durable(&self, key: &str, durable_key: &str) {
        match self.inner.store.remove_item(durable_key).await {
            Ok(()) => AtomicStats::bump(&self.inner.stats.deletes),
            Err(e) => {
                AtomicStats::bump(&self.inner.stats.errors);
                warn!(key, error = %e, "durable delete failed");
            }
        }
    }

    /// Drop every entry whose logical key starts with `prefix`. Returns the number of
    /// durable keys removed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        write(&self.inner.memory).retain(|k, _| !k.starts_with(prefix));
        let durable_prefix = self.inner.keys.durable_key(prefix);
        self.remove_durable_where(|k| k.starts_with(durable_prefix.as_str())).await
    }

    /// Drop everything under this manager's namespace, including pending fetch
    /// registrations. Fetches already running still answer their callers, but
    /// their values are not stored.
    pub async fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        write(&self.inner.memory).clear();
        lock(&self.inner.inflight).clear();
        let keys = self.inner.keys.clone();
        self.remove_durable_where(|k| keys.owns(k)).await;
    }

    async fn remove_durable_where(&self, matches: impl Fn(&str) -> bool) -> usize {
        let all = match self.inner.store.get_all_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                AtomicStats::bump(&self.inner.stats.errors);
                warn!(error = %e, "listing durable keys failed");
                return 0;
            }
        };
        let mut removed = 0;
        for durable_key in all.into_iter().filter(|k| matches(k.as_str())) {
            let key = self
                .inner
                .keys
                .logical_key(&durable_key)
                .unwrap_or(durable_key.as_str())
                .to_string();
            match self.inner.store.remove_item(&durable_key).await {
                Ok(()) => {
                    removed += 1;
                    AtomicStats::bump(&self.inner.stats.deletes);
                }
                Err(e) => {
                    AtomicStats::bump(&self.inner.stats.errors);
                    warn!(key = %key, error = %e, "durable delete failed");
                }
            }
        }
        removed
    }

    /// Run `fetcher` unless a fetch for `key` is already pending, in which case the
    /// pending result is shared. The registration is dropped once the fetch settles.
    pub async fn deduped_fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.join_or_start(key, fetcher).await.map_err(Error::Shared)
    }

    fn join_or_start<F, Fut>(&self, key: &str, fetcher: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut inflight = lock(&self.inner.inflight);
        if let Some(pending) = inflight.get(key) {
            AtomicStats::bump(&self.inner.stats.dedup_joins);
            debug!(key, "joining pending fetch");
            return pending.fetch.clone();
        }

        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        let fut = fetcher();
        let fetch = async move {
            let result = fut.await.map_err(Arc::new);
            if let Some(inner) = registry.upgrade() {
                inner.finish_fetch(&owned_key, id);
            }
            result
        }
        .boxed()
        .shared();

        inflight.insert(
            key.to_string(),
            InFlight {
                id,
                fetch: fetch.clone(),
            },
        );
        fetch
    }
}
