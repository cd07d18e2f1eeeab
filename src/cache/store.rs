//! Durable key-value tiers.
//!
//! The cache manager only stores JSON `CacheEntry` envelopes as strings; a store
//! never interprets the values it holds.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;
    async fn remove_item(&self, key: &str) -> Result<()>;
    async fn get_all_keys(&self) -> Result<Vec<String>>;
    fn name(&self) -> &'static str;
}

/// Process-local store, mostly useful for tests and as a volatile default.
#[derive(Default, Clone)]
pub struct MemoryStore {
    items: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items
            .read()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }
}

fn poisoned(key: &str) -> Error {
    Error::storage(key, "memory store lock poisoned")
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.read().map_err(|_| poisoned(key))?;
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.write().map_err(|_| poisoned(key))?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.write().map_err(|_| poisoned(key))?;
        items.remove(key);
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let items = self.items.read().map_err(|_| poisoned("*"))?;
        Ok(items.keys().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Store that keeps nothing; every read misses.
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for NullStore {
    async fn get_item(&self, _: &str) -> Result<Option<String>> {
        Ok(None)
    }
    async fn set_item(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
    async fn remove_item(&self, _: &str) -> Result<()> {
        Ok(())
    }
    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

/// One file per key under a directory.
///
/// Keys up to 100 bytes are hex-encoded into the file name, so any
/// key string (including `:` and `/`) is safe on every platform and the file holds
/// the raw value. Longer keys would overflow the 255-byte file name limit; they are
/// stored as `h-<sha256>.json` holding a `{key, value}` record so the original key
/// can still be listed.
pub struct FileStore {
    dir: PathBuf,
}

const FILE_SUFFIX: &str = ".json";
const HASHED_PREFIX: &str = "h-";
const MAX_ENCODED_KEY_BYTES: usize = 100;

#[derive(Serialize, Deserialize)]
struct HashedRecord {
    key: String,
    value: String,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn is_hashed(key: &str) -> bool {
    key.len() > MAX_ENCODED_KEY_BYTES
}

impl FileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(key: &str) -> String {
        if is_hashed(key) {
            let digest = Sha256::digest(key.as_bytes());
            format!("{}{}{}", HASHED_PREFIX, hex(&digest), FILE_SUFFIX)
        } else {
            format!("{}{}", hex(key.as_bytes()), FILE_SUFFIX)
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    fn decode_name(name: &str) -> Option<String> {
        let encoded = name.strip_suffix(FILE_SUFFIX)?;
        if encoded.len() % 2 != 0 {
            return None;
        }
        let bytes = (0..encoded.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        String::from_utf8(bytes).ok()
    }

    async fn read_record(&self, path: &Path, key: &str) -> Result<Option<HashedRecord>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage(key, e)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::storage(key, e))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if is_hashed(key) {
            let record = self.read_record(&path, key).await?;
            return Ok(record.filter(|r| r.key == key).map(|r| r.value));
        }
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(key, e)),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let name = Self::file_name(key);
        let contents = if is_hashed(key) {
            let record = HashedRecord {
                key: key.to_string(),
                value: value.to_string(),
            };
            serde_json::to_string(&record).map_err(|e| Error::storage(key, e))?
        } else {
            value.to_string()
        };
        // Each writer renames its own temp file into place.
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", name, Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, contents).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage(key, e));
        }
        tokio::fs::rename(&tmp, self.dir.join(name))
            .await
            .map_err(|e| Error::storage(key, e))
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(key, e)),
        }
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::storage("*", e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| Error::storage("*", e))? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with(HASHED_PREFIX) && name.ends_with(FILE_SUFFIX) {
                if let Some(record) = self.read_record(&entry.path(), name).await? {
                    keys.push(record.key);
                }
            } else if let Some(key) = Self::decode_name(name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
