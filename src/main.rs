#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # clusterlink
//!
//! Desktop helper that exposes private Kubernetes clusters to a hosted
//! control plane without inbound connectivity.
//!
//! For every selected kubeconfig context it runs `kubectl proxy`, serves a
//! local reverse HTTP server in front of it, and keeps an outbound TLS
//! tunnel to the relay that bridges raw bytes into that server.
//!
//! ## Subcommands
//!
//! - `clusterlink serve` (default): run the control API and the tunnels
//! - `clusterlink contexts`: list contexts of the local kubeconfig
//!
//! ## API surface
//!
//! | Method | Path                   | Auth | Description                       |
//! |--------|------------------------|------|-----------------------------------|
//! | GET    | `/api/health`          | No   | Liveness probe                    |
//! | GET    | `/api/relay-config`    | Yes  | Registered relay config           |
//! | POST   | `/api/relay-config`    | Yes  | Register relay config (once)      |
//! | GET    | `/api/tunnels`         | Yes  | List tunnels                      |
//! | POST   | `/api/tunnels`         | Yes  | Start a tunnel `{context}`        |
//! | DELETE | `/api/tunnels/{id}`    | Yes  | Stop a tunnel                     |
//! | GET    | `/api/tunnels/events`  | Yes  | SSE stream of tunnel list updates |
//! | GET    | `/api/kubeconfig`      | Yes  | Contexts of the local kubeconfig  |

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use clusterlink::{kubeconfig, routes, AppState, Config, RelayConfig, TunnelController, TunnelRegistry};

/// Expose private Kubernetes clusters through an outbound relay tunnel.
#[derive(Parser)]
#[command(name = "clusterlink", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control API and tunnels (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the contexts of the local kubeconfig.
    Contexts,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        Some(Commands::Contexts) => print_contexts().await,
        None => run_server(None).await,
    }
}

async fn print_contexts() {
    match kubeconfig::load_local().await {
        Ok(doc) => {
            for name in doc.context_names() {
                let marker = if name == doc.current_context { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("clusterlink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Data dir: {}", config.data_dir().display());

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set CLUSTERLINK_API_KEY or update config");
    }

    let config = Arc::new(config);
    let controller = Arc::new(TunnelController::new(config.clone(), TunnelRegistry::new()));

    if let (Some(template), Some(address)) = (
        config.relay.hostname_template.clone(),
        config.relay.address.clone(),
    ) {
        let relay = RelayConfig {
            hostname_template: template,
            relay_address: address,
        };
        if let Err(e) = controller.register_relay_config(relay).await {
            error!("Configured relay settings rejected: {e}");
        }
    } else {
        info!("Waiting for relay config via POST /api/relay-config");
    }

    let state = AppState::new(config.clone(), controller.clone());
    let shutdown_token = state.shutdown.clone();
    let app = routes::router(state);

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
        shutdown_token.cancel();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Tunnels keep their records so they come back on the next start.
    info!("Shutting down...");
    controller.shutdown_all().await;
    info!("Goodbye");
}
