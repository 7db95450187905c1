//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::tunnel::controller::TunnelController;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owns every tunnel; all tunnel routes go through it.
    pub controller: Arc<TunnelController>,
    /// Current number of SSE connections (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
    /// Fired when the server starts shutting down; ends long-lived streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Arc<Config>, controller: Arc<TunnelController>) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            controller,
            sse_connections: Arc::new(AtomicU32::new(0)),
            shutdown: CancellationToken::new(),
        }
    }
}
