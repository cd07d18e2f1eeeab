use crate::backend::BackendId;
use std::sync::Arc;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "backends.ollama.base_url")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_loader", "cache_manager")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the relay.
///
/// Per-backend failures (`Backend`, `Timeout`, `Cancelled`) are recovered inside the
/// dispatcher and only ever reach callers folded into `ChainExhausted`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("{backend}: {message}")]
    Backend { backend: BackendId, message: String },

    #[error("{backend} timeout")]
    Timeout { backend: BackendId, timeout_ms: u64 },

    #[error("{backend} cancelled")]
    Cancelled { backend: BackendId },

    #[error("All backends failed. Last error: {last_error}")]
    ChainExhausted { last_error: String },

    #[error("Failed to fetch data for '{key}'")]
    Fetch {
        key: String,
        #[source]
        source: Arc<Error>,
    },

    #[error("Durable store error for '{key}': {message}")]
    Storage { key: String, message: String },

    /// Error produced by a deduplicated fetch and shared between every waiting caller.
    #[error(transparent)]
    Shared(Arc<Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn backend(backend: BackendId, msg: impl Into<String>) -> Self {
        Error::Backend {
            backend,
            message: msg.into(),
        }
    }

    pub fn storage(key: impl Into<String>, msg: impl ToString) -> Self {
        Error::Storage {
            key: key.into(),
            message: msg.to_string(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            Error::Shared(inner) => inner.context(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_names_backend() {
        let err = Error::Timeout {
            backend: BackendId::Torch,
            timeout_ms: 3000,
        };
        assert_eq!(err.to_string(), "torch timeout");
    }

    #[test]
    fn test_chain_exhausted_includes_last_error() {
        let err = Error::ChainExhausted {
            last_error: "demo: offline responder unavailable".into(),
        };
        assert!(err
            .to_string()
            .contains("demo: offline responder unavailable"));
    }

    #[test]
    fn test_context_formatting() {
        let err = Error::configuration_with_context(
            "invalid base_url",
            ErrorContext::new()
                .with_field_path("backends.ollama.base_url")
                .with_source("config_loader"),
        );
        let msg = err.to_string();
        assert!(msg.contains("field: backends.ollama.base_url"));
        assert!(msg.contains("source: config_loader"));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_fetch_error_keeps_source() {
        let inner = Arc::new(Error::runtime("quote service down"));
        let err = Error::Fetch {
            key: "b3:PETR4".into(),
            source: inner,
        };
        assert_eq!(err.to_string(), "Failed to fetch data for 'b3:PETR4'");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.unwrap_or_default().contains("quote service down"));
    }
}
