//! Tunnel management endpoints.
//!
//! - `POST /api/relay-config`: register the relay config (first call wins)
//! - `GET /api/relay-config`: currently registered relay config, if any
//! - `GET /api/tunnels`: list tunnel records
//! - `POST /api/tunnels`: start a tunnel for a kubeconfig context
//! - `DELETE /api/tunnels/{id}`: stop and remove a tunnel

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::tunnel::controller::ControllerError;
use crate::tunnel::RelayConfig;
use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

/// Request body for `POST /api/tunnels`.
#[derive(Deserialize)]
pub struct StartTunnelRequest {
    /// kubeconfig context to expose.
    pub context: String,
}

fn error_response(err: &ControllerError) -> ApiError {
    let (status, code) = match err {
        ControllerError::RelayConfigMissing => (StatusCode::CONFLICT, "RELAY_CONFIG_MISSING"),
        ControllerError::InvalidTemplate(_) => (StatusCode::BAD_REQUEST, "INVALID_TEMPLATE"),
        ControllerError::InvalidContext => (StatusCode::BAD_REQUEST, "INVALID_CONTEXT"),
        ControllerError::Kubeconfig(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "KUBECONFIG_WRITE_FAILED")
        }
        ControllerError::Bind(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BIND_FAILED"),
    };
    (status, Json(json!({"error": err.to_string(), "code": code})))
}

/// `POST /api/relay-config`: register the process-wide relay config.
///
/// Responds `{"registered": true}` the first time (persisted tunnels are
/// restored before the response), `{"registered": false}` afterwards.
///
/// # Errors
///
/// - `400 Bad Request` with `{"code":"INVALID_TEMPLATE"}`: no `{{ID}}` in the template
pub async fn register_relay_config(
    State(state): State<AppState>,
    Json(payload): Json<RelayConfig>,
) -> Result<Json<Value>, ApiError> {
    let registered = state
        .controller
        .register_relay_config(payload)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({
        "registered": registered,
        "relayConfig": state.controller.relay_config(),
    })))
}

/// `GET /api/relay-config`
pub async fn get_relay_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "relayConfig": state.controller.relay_config() }))
}

/// `GET /api/tunnels`
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tunnels": state.controller.list_tunnels().await }))
}

/// `POST /api/tunnels`: start a tunnel and return its record.
///
/// # Errors
///
/// - `409 Conflict` with `{"code":"RELAY_CONFIG_MISSING"}`: register the relay config first
/// - `400 Bad Request` with `{"code":"INVALID_CONTEXT"}`: empty context
/// - `500 Internal Server Error`: kubeconfig could not be written or no port could be bound
pub async fn start_tunnel(
    State(state): State<AppState>,
    Json(payload): Json<StartTunnelRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    match state.controller.start_tunnel(&payload.context).await {
        Ok(record) => Ok((StatusCode::CREATED, Json(json!(record)))),
        Err(e) => {
            warn!(context = %payload.context, "Failed to start tunnel: {e}");
            Err(error_response(&e))
        }
    }
}

/// `DELETE /api/tunnels/{id}`: stop a tunnel. Unknown ids are not an error;
/// `removed` tells whether anything was there.
pub async fn stop_tunnel(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let removed = state.controller.stop_tunnel(&id).await;
    Json(json!({ "id": id, "removed": removed }))
}
