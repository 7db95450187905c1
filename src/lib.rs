#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! clusterlink library: the private-cluster tunnel manager.
//!
//! Building blocks:
//! - `tunnel`: tunnel records, reverse server, relay client, controller
//! - `supervisor`: `kubectl proxy` process supervision
//! - `registry` / `store`: in-memory tunnel list and its durable snapshot
//! - `kubeconfig`: generated per-tunnel kubeconfigs and the local reader
//! - `routes` / `auth`: the control API
//! - `config`: configuration loading

pub mod auth;
pub mod config;
pub mod kubeconfig;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use registry::TunnelRegistry;
pub use state::AppState;
pub use tunnel::controller::TunnelController;
pub use tunnel::{RelayConfig, TunnelRecord};
