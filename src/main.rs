mod app_state;
mod broadcaster;
mod chat_session;
mod config;
mod database;
mod embedded;
mod error;
mod handlers;
mod models;
mod proxy;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use app_state::AppState;
use broadcaster::{ws_dashboard_handler, DashboardBroadcaster};
use chat_session::ws_chat_handler;
use config::Config;
use database::Store;
use embedded::serve_embedded;
use proxy::ProxyEngine;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Config::from_env();
    info!("starting sectorflux, upstream={}, port={}", config.ollama_host, config.port);

    let store = match Store::init(&config.db_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to initialize store: {e}");
            std::process::exit(1);
        }
    };

    let proxy = Arc::new(ProxyEngine::new(config.ollama_host.clone(), Arc::clone(&store)));
    let broadcaster = Arc::new(DashboardBroadcaster::new());
    Arc::clone(&broadcaster).spawn_ticker(Arc::clone(&store), Arc::clone(&proxy));

    let state = AppState::new(Arc::clone(&store), proxy, broadcaster);

    let app = Router::new()
        .route("/api/generate", post(handlers::generate_handler))
        .route("/api/chat", post(handlers::chat_handler))
        .route("/api/tags", get(handlers::tags_handler))
        .route("/api/ps", get(handlers::ps_handler))
        .route("/api/logs", get(handlers::list_logs_handler))
        .route("/api/logs/{id}", get(handlers::get_log_handler))
        .route("/api/logs/{id}/starred", put(handlers::set_starred_handler))
        .route("/api/metrics", get(handlers::metrics_handler))
        .route("/api/version", get(handlers::version_handler))
        .route(
            "/api/config/cache",
            get(handlers::get_cache_config_handler).post(handlers::set_cache_config_handler),
        )
        .route("/api/replay/{id}", post(handlers::replay_handler))
        .route("/api/shutdown", post(handlers::shutdown_handler))
        .route("/favicon.ico", get(handlers::favicon_handler))
        .route("/ws/chat", get(ws_chat_handler))
        .route("/ws/dashboard", get(ws_dashboard_handler))
        .fallback(serve_embedded)
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("listening on {addr}");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        })
        .await
        .expect("server error");

    info!("draining write queue before exit");
    store.shutdown().await;
    info!("shutdown complete");
}
