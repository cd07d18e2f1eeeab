//! Attempt log and per-backend statistics.

use crate::backend::BackendId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub backend_id: BackendId,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl AttemptRecord {
    pub fn success(backend_id: BackendId, latency_ms: u64, timestamp: u64) -> Self {
        Self {
            backend_id,
            success: true,
            latency_ms,
            error: None,
            timestamp,
        }
    }

    pub fn failure(
        backend_id: BackendId,
        latency_ms: u64,
        error: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            backend_id,
            success: false,
            latency_ms,
            error: Some(error.into()),
            timestamp,
        }
    }
}

/// Running counters for one backend.
///
/// `average_latency_ms` is a mean over successful attempts only, and
/// `success_rate == success_count / total_attempts` (0 before any attempt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    pub backend_id: BackendId,
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_latency_ms: f64,
    pub last_used_at: Option<u64>,
    pub success_rate: f64,
}

impl BackendStats {
    pub fn new(backend_id: BackendId) -> Self {
        Self {
            backend_id,
            total_attempts: 0,
            success_count: 0,
            failure_count: 0,
            average_latency_ms: 0.0,
            last_used_at: None,
            success_rate: 0.0,
        }
    }

    pub fn record_success(&mut self, latency_ms: u64, now_ms: u64) {
        self.total_attempts += 1;
        self.success_count += 1;
        let n = self.success_count as f64;
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / n;
        self.last_used_at = Some(now_ms);
        self.refresh_rate();
    }

    pub fn record_failure(&mut self) {
        self.total_attempts += 1;
        self.failure_count += 1;
        self.refresh_rate();
    }

    fn refresh_rate(&mut self) {
        self.success_rate = if self.total_attempts == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_attempts as f64
        };
    }
}
