//! 缓存模块：指纹响应缓存与分层读穿缓存管理器。
//!
//! # Caching Module
//!
//! Two independent caches live here:
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`FingerprintCache`] | Small, synchronous, bounded response cache used by the dispatcher |
//! | [`TieredCacheManager`] | Async read-through cache over a memory tier and a [`DurableStore`] |
//! | [`DurableStore`] | Trait for the persistent key-value tier |
//! | [`MemoryStore`] / [`FileStore`] / [`NullStore`] | Durable tier implementations |
//!
//! ## Read-through strategies
//!
//! - [`TieredCacheManager::cache_first`]: serve a valid entry, otherwise fetch.
//! - [`TieredCacheManager::network_first`]: fetch, falling back to a valid entry on error.
//! - [`TieredCacheManager::stale_while_revalidate`]: serve the entry now, refresh it
//!   in the background.
//!
//! Concurrent fetches for the same key share one in-flight future.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ai_relay::cache::{CacheConfig, CacheOptions, MemoryStore, TieredCacheManager};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> ai_relay::Result<()> {
//! let quotes: TieredCacheManager<f64> =
//!     TieredCacheManager::new(CacheConfig::default(), Arc::new(MemoryStore::new()));
//!
//! let price = quotes
//!     .stale_while_revalidate(
//!         "b3:PETR4",
//!         || async { Ok(38.42) },
//!         CacheOptions::new().with_ttl(Duration::from_secs(60)),
//!     )
//!     .await?;
//! # let _ = price;
//! # Ok(())
//! # }
//! ```

pub mod fingerprint;
mod key;
mod manager;
mod store;

pub use fingerprint::{fingerprint, FingerprintCache, FingerprintEntry};
pub use key::{KeySpace, TtlPolicy, DEFAULT_NAMESPACE};
pub use manager::{
    BackgroundUpdate, CacheConfig, CacheEntry, CacheOptions, CacheStats, TieredCacheManager,
    DEFAULT_TTL,
};
pub use store::{DurableStore, FileStore, MemoryStore, NullStore};
