//! 后端接口：每个聊天后端只需实现一个异步请求/响应契约。
//!
//! # Backends
//!
//! A backend is one concrete integration able to answer a chat request. The
//! dispatcher only ever calls [`Backend::send_message`]; everything else
//! (connection setup, auth, model selection) is the backend's own business.
//!
//! | Id | Integration | Implementation |
//! |----|-------------|----------------|
//! | `torch` | on-device model | supplied by the host application |
//! | `ollama` | local dev server | [`OllamaBackend`] |
//! | `cloud` | cloud function | [`CloudFunctionBackend`] |
//! | `demo` | deterministic offline responder | [`OfflineBackend`] |
//!
//! Responses replayed from the dispatcher's fingerprint cache are reported with
//! [`ResponseSource::LocalCached`] instead of a backend id.

pub mod http;
pub mod offline;

pub use http::{CloudFunctionBackend, OllamaBackend};
pub use offline::OfflineBackend;

use crate::types::message::Message;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Identifier of a registrable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    Torch,
    Ollama,
    Cloud,
    Demo,
}

impl BackendId {
    pub const ALL: [BackendId; 4] = [
        BackendId::Torch,
        BackendId::Ollama,
        BackendId::Cloud,
        BackendId::Demo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::Torch => "torch",
            BackendId::Ollama => "ollama",
            BackendId::Cloud => "cloud",
            BackendId::Demo => "demo",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                Error::validation_with_context(
                    format!("unknown backend id '{}'", s),
                    ErrorContext::new()
                        .with_details("expected one of torch, ollama, cloud, demo")
                        .with_source("backend_id"),
                )
            })
    }
}

/// Where a dispatched response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseSource {
    Backend(BackendId),
    LocalCached,
}

impl ResponseSource {
    pub const LOCAL_CACHED: &'static str = "local-cached";

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Backend(id) => id.as_str(),
            ResponseSource::LocalCached => Self::LOCAL_CACHED,
        }
    }

    pub fn backend(&self) -> Option<BackendId> {
        match self {
            ResponseSource::Backend(id) => Some(*id),
            ResponseSource::LocalCached => None,
        }
    }
}

impl From<BackendId> for ResponseSource {
    fn from(id: BackendId) -> Self {
        ResponseSource::Backend(id)
    }
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResponseSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResponseSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == Self::LOCAL_CACHED {
            return Ok(ResponseSource::LocalCached);
        }
        raw.parse::<BackendId>()
            .map(ResponseSource::Backend)
            .map_err(serde::de::Error::custom)
    }
}

/// Reply produced by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReply {
    pub content: String,
}

impl BackendReply {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Minimal async request/response contract every chat integration implements.
///
/// `cancel` is triggered when the dispatcher abandons the attempt (timeout). Backends
/// holding connections or background work should stop promptly once it fires.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send_message(
        &self,
        user_id: &str,
        messages: &[Message],
        system_prompt: &str,
        cancel: CancellationToken,
    ) -> Result<BackendReply>;

    fn name(&self) -> &'static str;
}
