//! Read-through strategies, TTL handling, in-flight deduplication and
//! namespace-scoped invalidation of the tiered cache manager.

use ai_relay::cache::{
    CacheConfig, CacheOptions, DurableStore, FileStore, MemoryStore, TieredCacheManager,
};
use ai_relay::clock::ManualClock;
use ai_relay::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

fn manager_at(start_ms: u64) -> (TieredCacheManager<String>, MemoryStore, Arc<ManualClock>) {
    let clock = ManualClock::shared(start_ms);
    let store = MemoryStore::new();
    let mgr = TieredCacheManager::with_clock(
        CacheConfig::default(),
        Arc::new(store.clone()),
        clock.clone(),
    );
    (mgr, store, clock)
}

/// Durable tier that rejects every operation.
struct BrokenStore;

#[async_trait]
impl DurableStore for BrokenStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Err(Error::storage(key, "disk unavailable"))
    }
    async fn set_item(&self, key: &str, _value: &str) -> Result<()> {
        Err(Error::storage(key, "disk unavailable"))
    }
    async fn remove_item(&self, key: &str) -> Result<()> {
        Err(Error::storage(key, "disk unavailable"))
    }
    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Err(Error::storage("*", "disk unavailable"))
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn test_entry_expires_and_durable_copy_is_deleted() {
    let (mgr, store, clock) = manager_at(0);
    mgr.set_with_ttl("k", "v".into(), Duration::from_secs(60)).await;
    assert_eq!(mgr.get("k").await.as_deref(), Some("v"));

    clock.advance(Duration::from_secs(61));
    assert!(mgr.get("k").await.is_none());
    assert!(!store.contains_key("cache:k"));
    assert_eq!(mgr.memory_len(), 0);
}

#[tokio::test]
async fn test_default_ttl_applies_without_override() {
    let (mgr, _store, clock) = manager_at(0);
    mgr.set("currency:USD", "5.10".into()).await;

    clock.advance(Duration::from_secs(4 * 60));
    assert!(mgr.get("currency:USD").await.is_some());
    clock.advance(Duration::from_secs(60));
    assert!(mgr.get("currency:USD").await.is_none());
}

#[tokio::test]
async fn test_cache_first_skips_fetcher_on_hit() {
    let (mgr, _store, _clock) = manager_at(0);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let v = mgr
            .cache_first(
                "profile:42",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("alice".to_string())
                },
                CacheOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(v, "alice");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.stats().hits, 2);
}

#[tokio::test]
async fn test_cache_first_force_refresh_refetches() {
    let (mgr, _store, _clock) = manager_at(0);
    mgr.set("k", "old".into()).await;

    let v = mgr
        .cache_first(
            "k",
            || async { Ok("new".to_string()) },
            CacheOptions::new().force_refresh(),
        )
        .await
        .unwrap();
    assert_eq!(v, "new");
    assert_eq!(mgr.get("k").await.as_deref(), Some("new"));
}

#[tokio::test]
async fn test_cache_first_propagates_fetch_error() {
    let (mgr, store, _clock) = manager_at(0);
    let err = mgr
        .cache_first(
            "k",
            || async { Err(Error::runtime("upstream 503")) },
            CacheOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("upstream 503"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_network_first_falls_back_to_cached_value() {
    let (mgr, _store, _clock) = manager_at(0);
    mgr.set("b3:PETR4", "38.42".into()).await;

    let v = mgr
        .network_first(
            "b3:PETR4",
            || async { Err(Error::runtime("quote service down")) },
            CacheOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(v, "38.42");
}

#[tokio::test]
async fn test_network_first_rethrows_without_cached_value() {
    let (mgr, _store, _clock) = manager_at(0);
    let err = mgr
        .network_first(
            "b3:VALE3",
            || async { Err(Error::runtime("quote service down")) },
            CacheOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("quote service down"));
}

#[tokio::test]
async fn test_network_first_prefers_fresh_value() {
    let (mgr, _store, _clock) = manager_at(0);
    mgr.set("b3:PETR4", "38.42".into()).await;

    let v = mgr
        .network_first(
            "b3:PETR4",
            || async { Ok("39.00".to_string()) },
            CacheOptions::new().with_ttl(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    assert_eq!(v, "39.00");
    assert_eq!(mgr.get("b3:PETR4").await.as_deref(), Some("39.00"));
}

#[tokio::test]
async fn test_swr_serves_stale_value_without_waiting() {
    let (mgr, _store, _clock) = manager_at(0);
    mgr.set("b3:PETR4", "38.42".into()).await;

    let gate = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let fetch_gate = gate.clone();
    let v = mgr
        .stale_while_revalidate(
            "b3:PETR4",
            move || async move {
                fetch_gate.notified().await;
                Ok("39.10".to_string())
            },
            CacheOptions::new().on_background_update(move |res: Result<String>| {
                let _ = tx.send(res.map_err(|e| e.to_string()));
            }),
        )
        .await
        .unwrap();

    // Returned while the fetcher is still parked on the gate.
    assert_eq!(v, "38.42");
    assert_eq!(mgr.inflight_len(), 1);

    gate.notify_one();
    let update = rx.recv().await.unwrap();
    assert_eq!(update.as_deref(), Ok("39.10"));
    assert_eq!(mgr.get("b3:PETR4").await.as_deref(), Some("39.10"));
    assert_eq!(mgr.inflight_len(), 0);
}

#[tokio::test]
async fn test_swr_background_failure_keeps_stale_value() {
    let (mgr, _store, _clock) = manager_at(0);
    mgr.set("k", "stale".into()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let v = mgr
        .stale_while_revalidate(
            "k",
            || async { Err(Error::runtime("refresh failed")) },
            CacheOptions::new().on_background_update(move |res: Result<String>| {
                let _ = tx.send(res.is_err());
            }),
        )
        .await
        .unwrap();
    assert_eq!(v, "stale");

    assert!(rx.recv().await.unwrap());
    assert_eq!(mgr.get("k").await.as_deref(), Some("stale"));
}

#[tokio::test]
async fn test_swr_without_entry_fetches_in_foreground() {
    let (mgr, _store, _clock) = manager_at(0);
    let v = mgr
        .stale_while_revalidate("k", || async { Ok("fresh".to_string()) }, CacheOptions::new())
        .await
        .unwrap();
    assert_eq!(v, "fresh");
    assert_eq!(mgr.get("k").await.as_deref(), Some("fresh"));

    let err = mgr
        .stale_while_revalidate(
            "missing",
            || async { Err(Error::runtime("boom")) },
            CacheOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fetch { .. }));
    assert_eq!(err.to_string(), "Failed to fetch data for 'missing'");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_fetch() {
    let (mgr, _store, _clock) = manager_at(0);
    let calls = Arc::new(AtomicUsize::new(0));

    let fetcher = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, Error>("shared".to_string())
        }
    };

    let (a, b, c) = tokio::join!(
        mgr.cache_first("k", fetcher(calls.clone()), CacheOptions::new()),
        mgr.cache_first("k", fetcher(calls.clone()), CacheOptions::new()),
        mgr.network_first("k", fetcher(calls.clone()), CacheOptions::new()),
    );
    assert_eq!(a.unwrap(), "shared");
    assert_eq!(b.unwrap(), "shared");
    assert_eq!(c.unwrap(), "shared");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.stats().dedup_joins, 2);
    assert_eq!(mgr.inflight_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_swr_misses_share_one_fetch() {
    let (mgr, _store, _clock) = manager_at(0);
    let calls = Arc::new(AtomicUsize::new(0));

    let fetcher = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, Error>("quote".to_string())
        }
    };

    let (a, b) = tokio::join!(
        mgr.stale_while_revalidate("b3:PETR4", fetcher(calls.clone()), CacheOptions::new()),
        mgr.stale_while_revalidate("b3:PETR4", fetcher(calls.clone()), CacheOptions::new()),
    );
    assert_eq!(a.unwrap(), "quote");
    assert_eq!(b.unwrap(), "quote");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.stats().dedup_joins, 1);
    assert_eq!(mgr.inflight_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shared_fetch_failure_reaches_every_waiter() {
    let (mgr, _store, _clock) = manager_at(0);
    let fail = || async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Err::<String, _>(Error::runtime("down"))
    };
    let (a, b) = tokio::join!(mgr.deduped_fetch("k", fail), mgr.deduped_fetch("k", fail));
    assert!(a.unwrap_err().to_string().contains("down"));
    assert!(b.unwrap_err().to_string().contains("down"));
    assert_eq!(mgr.inflight_len(), 0);

    // A later call starts a new fetch.
    let v = mgr.deduped_fetch("k", || async { Ok("up".to_string()) }).await.unwrap();
    assert_eq!(v, "up");
}

#[tokio::test]
async fn test_invalidate_prefix_leaves_other_keys() {
    let (mgr, store, _clock) = manager_at(0);
    mgr.set("b3:PETR4", "38.42".into()).await;
    mgr.set("b3:VALE3", "61.00".into()).await;
    mgr.set("currency:USD", "5.10".into()).await;

    let removed = mgr.invalidate_prefix("b3:").await;
    assert_eq!(removed, 2);
    assert!(mgr.get("b3:PETR4").await.is_none());
    assert!(mgr.get("b3:VALE3").await.is_none());
    assert_eq!(mgr.get("currency:USD").await.as_deref(), Some("5.10"));
    assert!(store.contains_key("cache:currency:USD"));
}

#[tokio::test]
async fn test_clear_only_touches_own_namespace() {
    let (mgr, store, _clock) = manager_at(0);
    store.set_item("session:token", "abc").await.unwrap();
    mgr.set("a", "1".into()).await;
    mgr.set("b", "2".into()).await;

    mgr.clear().await;
    assert_eq!(mgr.memory_len(), 0);
    assert!(mgr.get("a").await.is_none());
    assert!(store.contains_key("session:token"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_clear_drops_pending_fetches_and_their_values() {
    let (mgr, _store, _clock) = manager_at(0);
    let gate = Arc::new(Notify::new());

    let fetch_gate = gate.clone();
    let before_clear = mgr.cache_first(
        "k",
        move || async move {
            fetch_gate.notified().await;
            Ok("old".to_string())
        },
        CacheOptions::new(),
    );
    let after_clear = async {
        tokio::task::yield_now().await;
        assert_eq!(mgr.inflight_len(), 1);
        mgr.clear().await;
        assert_eq!(mgr.inflight_len(), 0);

        let fresh = mgr
            .cache_first("k", || async { Ok("new".to_string()) }, CacheOptions::new())
            .await
            .unwrap();
        gate.notify_one();
        fresh
    };

    let (old, fresh) = tokio::join!(before_clear, after_clear);
    // The pre-clear caller still gets its answer, but it is not written back.
    assert_eq!(old.unwrap(), "old");
    assert_eq!(fresh, "new");
    assert_eq!(mgr.get("k").await.as_deref(), Some("new"));
    assert_eq!(mgr.inflight_len(), 0);
}

#[tokio::test]
async fn test_remove_drops_both_tiers() {
    let (mgr, store, _clock) = manager_at(0);
    mgr.set("k", "v".into()).await;
    mgr.remove("k").await;
    assert!(mgr.get("k").await.is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_broken_durable_tier_degrades_to_memory() {
    let mgr: TieredCacheManager<String> =
        TieredCacheManager::new(CacheConfig::default(), Arc::new(BrokenStore));
    assert_eq!(mgr.store_name(), "broken");

    mgr.set("k", "v".into()).await;
    assert_eq!(mgr.get("k").await.as_deref(), Some("v"));
    assert!(mgr.get("other").await.is_none());
    assert_eq!(mgr.invalidate_prefix("k").await, 0);

    let stats = mgr.stats();
    assert_eq!(stats.sets, 1);
    assert!(stats.errors >= 3);
}

#[tokio::test]
async fn test_file_store_survives_manager_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::shared(0);

    {
        let store = FileStore::open(dir.path()).await.unwrap();
        let mgr: TieredCacheManager<Vec<u32>> =
            TieredCacheManager::with_clock(CacheConfig::default(), Arc::new(store), clock.clone());
        mgr.set("portfolio:7", vec![1, 2, 3]).await;
    }

    let store = FileStore::open(dir.path()).await.unwrap();
    let mgr: TieredCacheManager<Vec<u32>> =
        TieredCacheManager::with_clock(CacheConfig::default(), Arc::new(store), clock);
    assert_eq!(mgr.get("portfolio:7").await, Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_file_store_persists_long_keys() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::shared(0);
    let key = format!("report:{}", "x".repeat(300));

    {
        let store = FileStore::open(dir.path()).await.unwrap();
        let mgr: TieredCacheManager<String> =
            TieredCacheManager::with_clock(CacheConfig::default(), Arc::new(store), clock.clone());
        mgr.set(&key, "monthly summary".into()).await;
        assert_eq!(mgr.stats().errors, 0);
    }

    let store = FileStore::open(dir.path()).await.unwrap();
    let mgr: TieredCacheManager<String> =
        TieredCacheManager::with_clock(CacheConfig::default(), Arc::new(store), clock);
    assert_eq!(mgr.get(&key).await.as_deref(), Some("monthly summary"));
    assert_eq!(mgr.invalidate_prefix("report:").await, 1);
    assert!(mgr.get(&key).await.is_none());
}
