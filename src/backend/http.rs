//! HTTP-backed chat integrations: the local dev server (Ollama chat API) and
//! the hosted cloud function.

use super::{Backend, BackendId, BackendReply};
use crate::types::message::Message;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

fn build_client() -> Result<reqwest::Client> {
    // The dispatcher enforces per-attempt timeouts; this is only an outer bound.
    let timeout_secs = env::var("AI_RELAY_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(120);

    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .build()
        .map_err(|e| {
            Error::configuration_with_context(
                format!("failed to build HTTP client: {}", e),
                ErrorContext::new().with_source("http_backend"),
            )
        })
}

fn parse_url(raw: &str, field: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| {
        Error::configuration_with_context(
            format!("invalid url '{}': {}", raw, e),
            ErrorContext::new()
                .with_field_path(field)
                .with_source("http_backend"),
        )
    })
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: String,
}

fn wire_messages<'a>(system_prompt: &str, messages: &'a [Message]) -> Vec<WireMessage<'a>> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(WireMessage {
            role: "system",
            content: system_prompt.to_string(),
        });
    }
    out.extend(messages.iter().map(|m| WireMessage {
        role: m.role.as_str(),
        content: m.text(),
    }));
    out
}

async fn post_json<B, R>(
    client: &reqwest::Client,
    backend: BackendId,
    url: Url,
    body: &B,
    cancel: &CancellationToken,
) -> Result<R>
where
    B: Serialize + ?Sized,
    R: for<'de> Deserialize<'de>,
{
    let call = async {
        let resp = client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::backend(backend, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::backend(
                backend,
                format!("HTTP {}: {}", status.as_u16(), text.trim()),
            ));
        }
        resp.json::<R>()
            .await
            .map_err(|e| Error::backend(backend, format!("invalid response body: {}", e)))
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(backend = %backend, "http call cancelled");
            Err(Error::Cancelled { backend })
        }
        res = call => res,
    }
}

/// Local development server speaking the Ollama `/api/chat` protocol.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: Url,
    model: String,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: parse_url(base_url, "backends.ollama.base_url")?,
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn send_message(
        &self,
        _user_id: &str,
        messages: &[Message],
        system_prompt: &str,
        cancel: CancellationToken,
    ) -> Result<BackendReply> {
        let url = self
            .base_url
            .join("api/chat")
            .map_err(|e| Error::backend(BackendId::Ollama, e.to_string()))?;
        let body = OllamaRequest {
            model: &self.model,
            messages: wire_messages(system_prompt, messages),
            stream: false,
        };
        let resp: OllamaResponse =
            post_json(&self.client, BackendId::Ollama, url, &body, &cancel).await?;
        Ok(BackendReply::new(resp.message.content))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

/// Hosted cloud function taking the whole conversation and returning `{content}`.
pub struct CloudFunctionBackend {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CloudRequest<'a> {
    user_id: &'a str,
    messages: &'a [Message],
    system_prompt: &'a str,
}

impl CloudFunctionBackend {
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: parse_url(endpoint, "backends.cloud.base_url")?,
        })
    }
}

#[async_trait]
impl Backend for CloudFunctionBackend {
    async fn send_message(
        &self,
        user_id: &str,
        messages: &[Message],
        system_prompt: &str,
        cancel: CancellationToken,
    ) -> Result<BackendReply> {
        let body = CloudRequest {
            user_id,
            messages,
            system_prompt,
        };
        post_json(
            &self.client,
            BackendId::Cloud,
            self.endpoint.clone(),
            &body,
            &cancel,
        )
        .await
    }

    fn name(&self) -> &'static str {
        "cloud_function"
    }
}
