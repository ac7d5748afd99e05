// `/ws/chat` WebSocket forwarder (§4.4). The split-socket / internal
// mpsc / dedicated send task shape is grounded in the teacher's
// `websocket.rs` `handle_socket`; cooperative mid-stream cancellation via
// a shared atomic flag is grounded in the streaming-proxy reference's
// chunk-sink abort pattern.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::models::{ChatTurn, NewLogEntry};
use crate::proxy::ProxyEngine;
use crate::telemetry;

const CHAT_TIMEOUT: Duration = Duration::from_secs(300);
const CHAT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_chat_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_chat_socket(socket, state))
}

async fn handle_chat_socket(socket: WebSocket, state: AppState) {
    info!("chat session opened");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = internal_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Set false on close; checked at every upstream chunk boundary to
    // cooperatively abort an in-flight forward.
    let active = Arc::new(AtomicBool::new(true));
    // Only one forward worker per connection; a turn that arrives while
    // the previous one is still running is rejected, not queued or
    // silently overlapped.
    let busy = Arc::new(AtomicBool::new(false));

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        if busy.swap(true, Ordering::SeqCst) {
            let _ = internal_tx.send(Message::Text(
                json!({"error": "A forward is already in progress on this connection"}).to_string().into(),
            ));
            continue;
        }

        let active = Arc::clone(&active);
        let busy_for_worker = Arc::clone(&busy);
        let internal_tx = internal_tx.clone();
        let state = state.clone();

        tokio::spawn(async move {
            run_turn(text.to_string(), active, &internal_tx, &state).await;
            busy_for_worker.store(false, Ordering::SeqCst);
        });
    }

    active.store(false, Ordering::SeqCst);
    send_task.abort();
    info!("chat session closed");
}

async fn run_turn(raw_message: String, active: Arc<AtomicBool>, internal_tx: &mpsc::UnboundedSender<Message>, state: &AppState) {
    let turn: ChatTurn = match serde_json::from_str(&raw_message) {
        Ok(turn) => turn,
        Err(_) => {
            send_error(internal_tx, "Invalid JSON");
            return;
        }
    };

    let cache_enabled = state.proxy.is_cache_enabled();

    if cache_enabled {
        match state.store.cache_lookup(&raw_message).await {
            Ok(Some((_, body))) => {
                let tel = telemetry::extract(body.as_bytes());
                state.store.submit_log(NewLogEntry {
                    method: "WS".to_string(),
                    endpoint: "/ws/chat".to_string(),
                    model: turn.model,
                    request_body: raw_message,
                    response_body: body.clone(),
                    response_status: 200,
                    duration_ms: 0,
                    prompt_tokens: tel.prompt_tokens,
                    completion_tokens: tel.completion_tokens,
                    prompt_eval_duration_ms: tel.prompt_eval_duration_ms,
                    eval_duration_ms: tel.eval_duration_ms,
                    ttft_ms: 0,
                });
                let _ = internal_tx.send(Message::Text(body.into()));
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("chat cache lookup failed, falling through to upstream: {e}"),
        }
    }

    forward_turn(raw_message, turn, active, internal_tx, &state.proxy, &state.store).await;
}

async fn forward_turn(
    raw_message: String,
    turn: ChatTurn,
    active: Arc<AtomicBool>,
    internal_tx: &mpsc::UnboundedSender<Message>,
    engine: &Arc<ProxyEngine>,
    store: &Arc<crate::database::Store>,
) {
    let upstream_body = json!({
        "model": turn.model,
        "messages": turn.messages,
        "stream": true,
    })
    .to_string();

    let client = match reqwest::Client::builder()
        .connect_timeout(CHAT_CONNECT_TIMEOUT)
        .read_timeout(CHAT_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("failed to build chat HTTP client: {e}");
            send_error(internal_tx, "Internal Server Error");
            return;
        }
    };

    let start = Instant::now();
    let resp = client
        .post(engine.chat_url())
        .header("Content-Type", "application/json")
        .body(upstream_body)
        .send()
        .await;

    let resp = match resp {
        Ok(resp) => resp,
        Err(_) => {
            if active.load(Ordering::SeqCst) {
                send_error(internal_tx, "Failed to connect to Ollama");
            }
            return;
        }
    };

    let status = resp.status();
    let mut stream = resp.bytes_stream();
    let mut accumulator: Vec<u8> = Vec::new();
    let mut ttft_ms = 0i64;
    let mut first_chunk = true;
    let mut cancelled = false;

    while let Some(chunk) = stream.next().await {
        if !active.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(_) => {
                if active.load(Ordering::SeqCst) {
                    send_error(internal_tx, "Failed to connect to Ollama");
                }
                return;
            }
        };
        if first_chunk {
            ttft_ms = start.elapsed().as_millis() as i64;
            first_chunk = false;
        }
        accumulator.extend_from_slice(&bytes);
        if internal_tx.send(Message::Text(String::from_utf8_lossy(&bytes).into_owned().into())).is_err() {
            cancelled = true;
            break;
        }
    }

    if cancelled || !active.load(Ordering::SeqCst) {
        // No log entry for a partial/aborted turn (§4.4, §7 CancelledBySocketClose).
        return;
    }

    let duration_ms = start.elapsed().as_millis() as i64;
    let tel = telemetry::extract(&accumulator);
    let response_body = String::from_utf8_lossy(&accumulator).into_owned();

    if status == reqwest::StatusCode::OK {
        if engine.is_cache_enabled() && !accumulator.is_empty() {
            store.cache_put(raw_message.clone(), 200, response_body.clone());
        }
        store.submit_log(NewLogEntry {
            method: "WS".to_string(),
            endpoint: "/ws/chat".to_string(),
            model: turn.model,
            request_body: raw_message,
            response_body,
            response_status: 200,
            duration_ms,
            prompt_tokens: tel.prompt_tokens,
            completion_tokens: tel.completion_tokens,
            prompt_eval_duration_ms: tel.prompt_eval_duration_ms,
            eval_duration_ms: tel.eval_duration_ms,
            ttft_ms,
        });
    }
}

fn send_error(internal_tx: &mpsc::UnboundedSender<Message>, reason: &str) {
    let _ = internal_tx.send(Message::Text(json!({"error": reason}).to_string().into()));
}
