//! HTTP route handlers for the control API.
//!
//! Each sub-module corresponds to an endpoint group. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware.

pub mod events;
pub mod health;
pub mod kubeconfig;
pub mod tunnels;

use axum::{
    middleware,
    routing::{delete, get},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::AppState;

/// Build the control API router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route(
            "/api/relay-config",
            get(tunnels::get_relay_config).post(tunnels::register_relay_config),
        )
        .route(
            "/api/tunnels",
            get(tunnels::list_tunnels).post(tunnels::start_tunnel),
        )
        .route("/api/tunnels/events", get(events::tunnel_events))
        .route("/api/tunnels/{id}", delete(tunnels::stop_tunnel))
        .route("/api/kubeconfig", get(kubeconfig::local_kubeconfig))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
