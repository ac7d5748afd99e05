// Periodic dashboard fan-out (§4.5). The ticker-task-plus-locked-set
// shape is grounded in the teacher's `broker.rs` periodic purge task;
// observer registration is grounded in the teacher's `websocket.rs`
// per-connection internal-channel pattern.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::database::Store;
use crate::models::DashboardSnapshot;
use crate::proxy::ProxyEngine;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const DASHBOARD_LOG_LIMIT: i64 = 50;

pub struct DashboardBroadcaster {
    observers: Mutex<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
}

impl DashboardBroadcaster {
    pub fn new() -> Self {
        DashboardBroadcaster { observers: Mutex::new(HashMap::new()) }
    }

    pub fn add(&self, id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.observers.lock().expect("observers lock poisoned").insert(id, sender);
    }

    pub fn remove(&self, id: &Uuid) {
        self.observers.lock().expect("observers lock poisoned").remove(id);
    }

    fn broadcast(&self, payload: &str) {
        let observers = self.observers.lock().expect("observers lock poisoned");
        for sender in observers.values() {
            // Best-effort; a closed channel just means that observer
            // hasn't been removed yet. Sends happen under the lock,
            // which is fine at this scale (§4.5).
            let _ = sender.send(payload.to_string());
        }
    }

    /// Spawns the 1-second ticker. Runs until the process exits.
    pub fn spawn_ticker(self: Arc<Self>, store: Arc<Store>, proxy: Arc<ProxyEngine>) {
        tokio::spawn(async move {
            let mut interval = time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                let snapshot = match build_snapshot(&store, &proxy).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("failed to build dashboard snapshot: {e}");
                        continue;
                    }
                };
                match serde_json::to_string(&snapshot) {
                    Ok(payload) => {
                        debug!(running_model = %snapshot.running_model, "broadcasting dashboard snapshot");
                        self.broadcast(&payload);
                    }
                    Err(e) => warn!("failed to serialize dashboard snapshot: {e}"),
                }
            }
        });
    }
}

impl Default for DashboardBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

async fn build_snapshot(store: &Store, proxy: &ProxyEngine) -> Result<DashboardSnapshot, crate::error::SectorFluxError> {
    let logs = store.get_logs(DASHBOARD_LOG_LIMIT).await?;
    let metrics = store.aggregate_metrics().await?;
    let running_model = fetch_running_model(proxy).await;

    Ok(DashboardSnapshot { logs, metrics, running_model })
}

async fn fetch_running_model(proxy: &ProxyEngine) -> String {
    let resp = proxy.forward_ps().await;
    if resp.status() != axum::http::StatusCode::OK {
        return "Ollama Offline".to_string();
    }
    let body = match axum::body::to_bytes(resp.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(_) => return "Ollama Offline".to_string(),
    };
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return "Ollama Offline".to_string(),
    };
    value
        .get("models")
        .and_then(|m| m.as_array())
        .and_then(|models| models.first())
        .and_then(|model| model.get("name"))
        .and_then(|name| name.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "None".to_string())
}

pub async fn ws_dashboard_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_dashboard_socket(socket, state))
}

async fn handle_dashboard_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = Uuid::new_v4();

    state.broadcaster.add(id, tx);

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Server-push only; the receive loop exists solely to detect close.
    while let Some(msg) = ws_receiver.next().await {
        if msg.is_err() {
            break;
        }
    }

    state.broadcaster.remove(&id);
    send_task.abort();
}
