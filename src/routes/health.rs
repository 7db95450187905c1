//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::tunnel::{KubectlProxyStatus, TunnelStatus};
use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, whether a relay config is registered,
/// and tunnel counts. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let tunnels = state.controller.list_tunnels().await;

    let connected = tunnels
        .iter()
        .filter(|t| t.tunnel_status == TunnelStatus::Connected)
        .count();
    let proxies_running = tunnels
        .iter()
        .filter(|t| t.kubectl_proxy_status == KubectlProxyStatus::Running)
        .count();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "relay_registered": state.controller.relay_config().is_some(),
        "tunnels": {
            "total": tunnels.len(),
            "connected": connected,
            "kubectl_running": proxies_running,
        },
    }))
}
