//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `CLUSTERLINK_API_KEY`, `CLUSTERLINK_LISTEN`,
//!    `CLUSTERLINK_DATA_DIR`, `CLUSTERLINK_HOSTNAME_TEMPLATE`,
//!    `CLUSTERLINK_RELAY_ADDRESS`
//! 2. **Config file**: path via `--config <path>`, or `clusterlink.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7373"
//! data_dir = "~/.clusterlink"
//! # Read once when no current state file exists yet.
//! legacy_state_file = "~/.clusterlink/privateClusterProxies.dump"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [kubectl]
//! binary = "kubectl"
//! restart_delay_ms = 3000
//!
//! [logging]
//! level = "info"
//!
//! # Optional: when both fields are set the relay config is registered at
//! # startup instead of waiting for POST /api/relay-config.
//! [relay]
//! hostname_template = "https://{{ID}}.relay.example.com"
//! address = "relay.example.com:443"
//! reconnect_initial_delay_ms = 1000
//! reconnect_max_delay_ms = 30000
//! insecure_skip_verify = false      # development only
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::expand_tilde;

/// File name of the unscoped tunnel list written by earlier releases.
pub const LEGACY_STATE_FILE: &str = "privateClusterProxies.dump";

/// Lower bound on configured delays, so a zero never turns a wait into a spin.
const MIN_DELAY_MS: u64 = 10;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub kubectl: KubectlConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control API and persistence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the local control API (default `127.0.0.1:7373`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for the persisted tunnel registry. `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Unscoped tunnel file written by earlier releases. Defaults to
    /// `<data_dir>/privateClusterProxies.dump`.
    #[serde(default)]
    pub legacy_state_file: Option<String>,
}

/// Authentication settings for the control API.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `CLUSTERLINK_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// How `kubectl proxy` children are spawned and restarted.
#[derive(Debug, Clone, Deserialize)]
pub struct KubectlConfig {
    /// kubectl binary, resolved through `PATH` when not absolute.
    #[serde(default = "default_kubectl_binary")]
    pub binary: String,
    /// Fixed delay before restarting a `kubectl proxy` that exited on its own.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Where per-tunnel kubeconfig files are written.
    #[serde(default = "default_kubeconfig_dir")]
    pub kubeconfig_dir: String,
}

/// Relay connection settings.
///
/// `hostname_template` and `address` are optional: the relay config is
/// normally supplied at runtime by the control plane. The remaining fields
/// tune the relay leg regardless of where the config came from.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    pub hostname_template: Option<String>,
    pub address: Option<String>,
    /// First reconnect delay (default 1s).
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    /// Cap on the fibonacci reconnect delay (default 30s).
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Interval between port liveness probes while a tunnel comes up.
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
    /// Accept any relay certificate. Development only; logs a warning.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:7373".to_string()
}
fn default_data_dir() -> String {
    "~/.clusterlink".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_kubectl_binary() -> String {
    "kubectl".to_string()
}
fn default_restart_delay_ms() -> u64 {
    3000
}
fn default_kubeconfig_dir() -> String {
    std::env::temp_dir()
        .join("clusterlink")
        .to_string_lossy()
        .into_owned()
}
fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_readiness_poll_ms() -> u64 {
    250
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            legacy_state_file: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            binary: default_kubectl_binary(),
            restart_delay_ms: default_restart_delay_ms(),
            kubeconfig_dir: default_kubeconfig_dir(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            hostname_template: None,
            address: None,
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            readiness_poll_ms: default_readiness_poll_ms(),
            insecure_skip_verify: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            kubectl: KubectlConfig::default(),
            relay: RelaySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `clusterlink.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("clusterlink.toml").exists() {
            let content = std::fs::read_to_string("clusterlink.toml")
                .expect("Failed to read clusterlink.toml");
            toml::from_str(&content).expect("Failed to parse clusterlink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("CLUSTERLINK_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("CLUSTERLINK_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("CLUSTERLINK_DATA_DIR") {
            config.server.data_dir = dir;
        }
        if let Ok(template) = std::env::var("CLUSTERLINK_HOSTNAME_TEMPLATE") {
            config.relay.hostname_template = Some(template);
        }
        if let Ok(address) = std::env::var("CLUSTERLINK_RELAY_ADDRESS") {
            config.relay.address = Some(address);
        }

        config
    }

    /// Data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.server.data_dir)
    }

    /// Legacy tunnel file consulted when the current one is missing.
    pub fn legacy_state_file(&self) -> PathBuf {
        match self.server.legacy_state_file {
            Some(ref path) => expand_tilde(path),
            None => self.data_dir().join(LEGACY_STATE_FILE),
        }
    }

    /// Per-tunnel kubeconfig directory with `~` expanded.
    pub fn kubeconfig_dir(&self) -> PathBuf {
        expand_tilde(&self.kubectl.kubeconfig_dir)
    }
}

impl KubectlConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms.max(MIN_DELAY_MS))
    }
}

impl RelaySettings {
    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms.max(MIN_DELAY_MS))
    }

    /// Never below the initial delay.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms).max(self.reconnect_initial_delay())
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms.max(MIN_DELAY_MS))
    }
}
