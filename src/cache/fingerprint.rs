//! Fingerprint-keyed response cache used by the dispatcher.
//!
//! The fingerprint is the first 100 characters of the latest user message. An
//! empty fingerprint means "not cacheable" and never hits or stores.

use crate::types::message::{latest_user_message, Message};
use lru::LruCache;
use std::time::Duration;

pub const FINGERPRINT_CHARS: usize = 100;
pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Derive the cache key for a conversation.
pub fn fingerprint(messages: &[Message]) -> String {
    latest_user_message(messages)
        .map(|m| m.text().chars().take(FINGERPRINT_CHARS).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintEntry<V> {
    pub response: V,
    pub timestamp: u64,
}

/// Capacity-bounded, expire-on-read cache. At capacity, inserting a new key evicts
/// the entry with the smallest stored timestamp (oldest insertion wins ties).
pub struct FingerprintCache<V> {
    // Recency order is insertion/update order: lookups only peek.
    entries: LruCache<String, FingerprintEntry<V>>,
    capacity: usize,
    ttl_ms: u64,
}

impl<V: Clone> FingerprintCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn lookup(&mut self, key: &str, now_ms: u64) -> Option<V> {
        if key.is_empty() {
            return None;
        }
        let expired = {
            let entry = self.entries.peek(key)?;
            now_ms.saturating_sub(entry.timestamp) >= self.ttl_ms
        };
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.peek(key).map(|e| e.response.clone())
    }

    /// Store `value` under `key`, returning the evicted key if one was dropped.
    pub fn insert(&mut self, key: &str, value: V, now_ms: u64) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        let mut evicted = None;
        if !self.entries.contains(key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .rev()
                .min_by_key(|(_, e)| e.timestamp)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                self.entries.pop(&k);
                evicted = Some(k);
            }
        }
        self.entries.put(
            key.to_string(),
            FingerprintEntry {
                response: value,
                timestamp: now_ms,
            },
        );
        evicted
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<V: Clone> Default for FingerprintCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
