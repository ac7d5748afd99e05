// Administrative and proxied HTTP endpoints (§6). Grounded in the
// teacher's `handlers.rs` for the State-extractor/Json-response shape;
// the business logic itself comes from the store and proxy engine, not
// the teacher (which has no analogous endpoints).
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use crate::app_state::AppState;
use crate::error::SectorFluxError;
use crate::models::{
    AggregateMetrics, CacheConfigRequest, CacheConfigStatus, LogEntry, StarredRequest, StarredResponse, VersionInfo,
};
use crate::proxy::NO_CACHE_HEADER;

fn bypass_cache(headers: &HeaderMap) -> bool {
    headers
        .get(NO_CACHE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub async fn generate_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    state.proxy.forward("/api/generate", body, bypass_cache(&headers)).await
}

pub async fn chat_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    state.proxy.forward("/api/chat", body, bypass_cache(&headers)).await
}

pub async fn tags_handler(State(state): State<AppState>) -> Response {
    state.proxy.forward_tags().await
}

pub async fn ps_handler(State(state): State<AppState>) -> Response {
    state.proxy.forward_ps().await
}

pub async fn list_logs_handler(State(state): State<AppState>) -> Result<Json<Vec<LogEntry>>, SectorFluxError> {
    Ok(Json(state.store.get_logs(50).await?))
}

pub async fn get_log_handler(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response, SectorFluxError> {
    match state.store.get_log(id).await? {
        Some(entry) => Ok(Json(entry).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

pub async fn set_starred_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<StarredRequest>,
) -> Result<Json<StarredResponse>, SectorFluxError> {
    state.store.set_starred(id, request.starred).await?;
    Ok(Json(StarredResponse { id, is_starred: request.starred }))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<Json<AggregateMetrics>, SectorFluxError> {
    Ok(Json(state.store.aggregate_metrics().await?))
}

pub async fn version_handler() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    })
}

pub async fn get_cache_config_handler(State(state): State<AppState>) -> Json<CacheConfigStatus> {
    Json(CacheConfigStatus { enabled: state.proxy.is_cache_enabled() })
}

pub async fn set_cache_config_handler(
    State(state): State<AppState>,
    Json(request): Json<CacheConfigRequest>,
) -> Json<CacheConfigStatus> {
    state.proxy.set_cache_enabled(request.enabled);
    Json(CacheConfigStatus { enabled: request.enabled })
}

pub async fn replay_handler(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response, SectorFluxError> {
    let entry = match state.store.get_log(id).await? {
        Some(entry) => entry,
        None => return Ok(StatusCode::NOT_FOUND.into_response()),
    };

    let body = Bytes::from(entry.request_body.into_bytes());
    Ok(state.proxy.forward(&entry.endpoint, body, true).await)
}

pub async fn shutdown_handler(State(state): State<AppState>) -> StatusCode {
    info!("shutdown requested via /api/shutdown");
    state.shutdown.notify_one();
    StatusCode::OK
}

pub async fn favicon_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}
