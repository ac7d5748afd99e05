// Shared application state handed to every axum handler. Grounded in the
// teacher's `app_state.rs`: a small `Clone` struct of `Arc`s, injected
// via axum's `State` extractor.
use std::sync::Arc;

use tokio::sync::Notify;

use crate::broadcaster::DashboardBroadcaster;
use crate::database::Store;
use crate::proxy::ProxyEngine;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub proxy: Arc<ProxyEngine>,
    pub broadcaster: Arc<DashboardBroadcaster>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(store: Arc<Store>, proxy: Arc<ProxyEngine>, broadcaster: Arc<DashboardBroadcaster>) -> Self {
        AppState { store, proxy, broadcaster, shutdown: Arc::new(Notify::new()) }
    }
}
