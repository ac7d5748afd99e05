// Data types shared across the store, proxy engine, and HTTP surface.
use serde::{Deserialize, Serialize};

/// One row of the `requests` log table (§3 LogEntry).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: String,
    pub method: String,
    pub endpoint: String,
    pub model: String,
    pub request_body: String,
    pub response_body: String,
    pub response_status: i64,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub prompt_eval_duration_ms: i64,
    pub eval_duration_ms: i64,
    pub ttft_ms: i64,
    pub is_starred: bool,
}

/// A not-yet-persisted log row, submitted by the proxy engine and chat
/// session. `id` and `timestamp` are assigned by the store on insert.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub method: String,
    pub endpoint: String,
    pub model: String,
    pub request_body: String,
    pub response_body: String,
    pub response_status: i64,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub prompt_eval_duration_ms: i64,
    pub eval_duration_ms: i64,
    pub ttft_ms: i64,
}

/// Aggregated metrics, computed on demand (§3 AggregateMetrics).
#[derive(Debug, Clone, Serialize, Default)]
pub struct AggregateMetrics {
    pub total_requests: i64,
    pub avg_latency_ms: f64,
    pub cache_hit_rate: f64,
}

/// Telemetry fields extracted from an NDJSON response body (§4.2).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub prompt_eval_duration_ms: i64,
    pub eval_duration_ms: i64,
}

/// Inbound `/ws/chat` turn: `{model, messages}` (§4.4).
#[derive(Debug, Deserialize)]
pub struct ChatTurn {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: serde_json::Value,
}

fn default_model() -> String {
    "unknown".to_string()
}

#[derive(Debug, Serialize)]
pub struct StarredResponse {
    pub id: i64,
    pub is_starred: bool,
}

#[derive(Debug, Deserialize)]
pub struct StarredRequest {
    pub starred: bool,
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub version: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Serialize)]
pub struct CacheConfigStatus {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct CacheConfigRequest {
    pub enabled: bool,
}

/// One dashboard snapshot, pushed once per second to every observer (§4.5).
#[derive(Debug, Serialize)]
pub struct DashboardSnapshot {
    pub logs: Vec<LogEntry>,
    pub metrics: AggregateMetrics,
    pub running_model: String,
}
