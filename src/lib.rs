//! # ai-relay
//!
//! 面向聊天与外部 API 的弹性数据访问层：多后端回退调度与分层读穿缓存。
//!
//! Resilient data-access layer for chat and externally-sourced data.
//!
//! ## Overview
//!
//! Two components, usable independently:
//!
//! - **Backend dispatcher** ([`dispatcher::BackendDispatcher`]): answers a chat request
//!   by trying an ordered list of backends with per-attempt timeouts, recording every
//!   attempt and caching responses by fingerprint. A deterministic offline responder
//!   terminates every chain.
//! - **Tiered cache manager** ([`cache::TieredCacheManager`]): generic read-through
//!   cache over an in-process memory tier and a durable key-value store, with
//!   cache-first, network-first and stale-while-revalidate strategies and
//!   per-key fetch deduplication.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backend`] | Backend contract, ids and shipped integrations |
//! | [`dispatcher`] | Fallback chain, attempt log, statistics, configuration |
//! | [`cache`] | Fingerprint cache, tiered cache manager, durable stores |
//! | [`clock`] | Injectable wall clock |
//! | [`types`] | Chat message types |
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod dispatcher;
pub mod types;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

// Re-export main types for convenience
pub use backend::{Backend, BackendId, BackendReply, ResponseSource};
pub use cache::{CacheConfig, CacheOptions, DurableStore, TieredCacheManager};
pub use dispatcher::{BackendDispatcher, DispatchResponse, DispatcherConfig, ResponseMetadata};
pub use types::message::{Message, MessageRole};
