// Streaming reverse-proxy pipeline (§4.3). Grounded in
// `ollama-lmstudio-proxy-rs`'s streaming handler for the chunk-sink /
// TTFT / accumulator shape, translated from warp's `Body::wrap_stream`
// to axum's `Body::from_stream` as used in `ai-proxy`'s dispatch path.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::database::Store;
use crate::models::NewLogEntry;
use crate::telemetry;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
const TAGS_TIMEOUT: Duration = Duration::from_secs(5);
const PS_TIMEOUT: Duration = Duration::from_secs(1);

pub const NO_CACHE_HEADER: &str = "x-sectorflux-no-cache";
const CACHE_STATUS_HEADER: &str = "X-SectorFlux-Cache";

/// Forwards `/api/generate` and `/api/chat` POSTs to upstream, with cache
/// short-circuiting and per-chunk streaming back to the client.
pub struct ProxyEngine {
    client: reqwest::Client,
    upstream: String,
    store: Arc<Store>,
    cache_enabled: AtomicBool,
}

impl ProxyEngine {
    pub fn new(upstream: String, store: Arc<Store>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_TIMEOUT)
            .read_timeout(UPSTREAM_TIMEOUT)
            .build()
            .expect("failed to build upstream HTTP client");

        ProxyEngine { client, upstream, store, cache_enabled: AtomicBool::new(true) }
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Relaxed)
    }

    /// Upstream URL for the chat session's own streaming POST (§4.4).
    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.upstream)
    }

    /// The proxy's single entry point. `bypass_cache` is set by the
    /// caller from the `X-SectorFlux-No-Cache` request header.
    pub async fn forward(&self, target_path: &str, request_body: Bytes, bypass_cache: bool) -> Response {
        let request_body_str = String::from_utf8_lossy(&request_body).into_owned();
        let model = telemetry::extract_model(&request_body);
        let start = Instant::now();
        let cache_eligible = self.is_cache_enabled() && !bypass_cache;

        if cache_eligible {
            match self.store.cache_lookup(&request_body_str).await {
                Ok(Some((status, body))) => {
                    return self.serve_cache_hit(target_path, &model, request_body_str, status, body).await;
                }
                Ok(None) => {}
                Err(e) => warn!("cache lookup failed, falling through to upstream: {e}"),
            }
        }

        self.forward_to_upstream(target_path, model, request_body_str, start, cache_eligible).await
    }

    async fn serve_cache_hit(
        &self,
        target_path: &str,
        model: &str,
        request_body: String,
        status: i64,
        body: String,
    ) -> Response {
        let tel = telemetry::extract(body.as_bytes());
        self.store.submit_log(NewLogEntry {
            method: "POST".to_string(),
            endpoint: target_path.to_string(),
            model: model.to_string(),
            request_body,
            response_body: body.clone(),
            response_status: status,
            duration_ms: 0,
            prompt_tokens: tel.prompt_tokens,
            completion_tokens: tel.completion_tokens,
            // Cache-hit rows carry zero phase durations (§4.3(3)); only
            // the token counts come from extraction.
            prompt_eval_duration_ms: 0,
            eval_duration_ms: 0,
            ttft_ms: 0,
        });

        let status_code = StatusCode::from_u16(status as u16).unwrap_or(StatusCode::OK);
        Response::builder()
            .status(status_code)
            .header(CACHE_STATUS_HEADER, "HIT")
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .expect("cache-hit response is well-formed")
    }

    async fn forward_to_upstream(
        &self,
        target_path: &str,
        model: String,
        request_body_str: String,
        start: Instant,
        cache_eligible: bool,
    ) -> Response {
        let url = format!("{}{}", self.upstream, target_path);
        let upstream_resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(request_body_str.clone())
            .send()
            .await;

        let upstream_resp = match upstream_resp {
            Ok(resp) => resp,
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as i64;
                let message = format!("Error forwarding request to Ollama: {e}");
                self.store.submit_log(NewLogEntry {
                    method: "POST".to_string(),
                    endpoint: target_path.to_string(),
                    model,
                    request_body: request_body_str,
                    response_body: message.clone(),
                    response_status: 500,
                    duration_ms,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    prompt_eval_duration_ms: 0,
                    eval_duration_ms: 0,
                    ttft_ms: 0,
                });
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .header(CACHE_STATUS_HEADER, "MISS")
                    .body(Body::from(message))
                    .expect("error response is well-formed");
            }
        };

        let status = upstream_resp.status();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();

        let store = Arc::clone(&self.store);
        let target_path_owned = target_path.to_string();
        tokio::spawn(async move {
            let mut upstream_stream = upstream_resp.bytes_stream();
            let mut accumulator: Vec<u8> = Vec::new();
            let mut ttft_ms = 0i64;
            let mut first_chunk = true;

            while let Some(chunk) = upstream_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if first_chunk {
                            ttft_ms = start.elapsed().as_millis() as i64;
                            first_chunk = false;
                        }
                        accumulator.extend_from_slice(&bytes);
                        if tx.send(Ok(bytes)).is_err() {
                            // Client went away; stop pulling from upstream.
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(std::io::Error::other(e.to_string())));
                        break;
                    }
                }
            }
            drop(tx);

            let duration_ms = start.elapsed().as_millis() as i64;
            let tel = telemetry::extract(&accumulator);
            let response_body = String::from_utf8_lossy(&accumulator).into_owned();

            if cache_eligible && status == StatusCode::OK && !accumulator.is_empty() {
                store.cache_put(request_body_str.clone(), 200, response_body.clone());
            }

            info!(endpoint = %target_path_owned, %status, duration_ms, "forwarded request");
            store.submit_log(NewLogEntry {
                method: "POST".to_string(),
                endpoint: target_path_owned,
                model,
                request_body: request_body_str,
                response_body,
                response_status: status.as_u16() as i64,
                duration_ms,
                prompt_tokens: tel.prompt_tokens,
                completion_tokens: tel.completion_tokens,
                prompt_eval_duration_ms: tel.prompt_eval_duration_ms,
                eval_duration_ms: tel.eval_duration_ms,
                ttft_ms,
            });
        });

        let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Response::builder()
            .status(status)
            .header(CACHE_STATUS_HEADER, "MISS")
            .header("Content-Type", "application/json")
            .body(Body::from_stream(body_stream))
            .expect("streaming response is well-formed")
    }

    /// Unlogged, non-streaming GET passthrough used for `/api/tags` and
    /// `/api/ps` (§6).
    pub async fn forward_get(&self, path: &str, timeout: Duration) -> Response {
        let url = format!("{}{}", self.upstream, path);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                match resp.bytes().await {
                    Ok(body) => Response::builder()
                        .status(status)
                        .header("Content-Type", "application/json")
                        .body(Body::from(body))
                        .expect("passthrough response is well-formed"),
                    Err(e) => (StatusCode::BAD_GATEWAY, format!("Error reading Ollama response: {e}")).into_response(),
                }
            }
            Err(e) => (StatusCode::BAD_GATEWAY, format!("Error forwarding request to Ollama: {e}")).into_response(),
        }
    }

    pub async fn forward_tags(&self) -> Response {
        self.forward_get("/api/tags", TAGS_TIMEOUT).await
    }

    pub async fn forward_ps(&self) -> Response {
        self.forward_get("/api/ps", PS_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_flag_defaults_to_enabled_and_toggles() {
        let store = Arc::new(Store::init(":memory:").await.expect("init"));
        let engine = ProxyEngine::new("http://localhost:11434".to_string(), store);
        assert!(engine.is_cache_enabled());
        engine.set_cache_enabled(false);
        assert!(!engine.is_cache_enabled());
    }

    #[tokio::test]
    async fn cache_hit_logs_zero_duration_and_preserves_body() {
        let store = Arc::new(Store::init(":memory:").await.expect("init"));
        store.cache_put("{\"model\":\"llama3\"}".to_string(), 200, "{\"response\":\"hi\",\"done\":true}".to_string());
        // Give the fire-and-forget cache write a moment to land before the
        // lookup below, which reads the pool directly.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let engine = ProxyEngine::new("http://localhost:11434".to_string(), Arc::clone(&store));
        let resp = engine
            .forward("/api/generate", Bytes::from_static(b"{\"model\":\"llama3\"}"), false)
            .await;
        assert_eq!(resp.headers().get(CACHE_STATUS_HEADER).unwrap(), "HIT");

        // Drains the cache-hit log write queued by `forward` above; must
        // run after forward, not before, since shutdown ends the writer.
        store.shutdown().await;
        let logs = store.get_logs(1).await.expect("get_logs");
        assert_eq!(logs[0].duration_ms, 0);
        assert_eq!(logs[0].model, "llama3");
        assert_eq!(logs[0].prompt_eval_duration_ms, 0);
        assert_eq!(logs[0].eval_duration_ms, 0);
    }
}
