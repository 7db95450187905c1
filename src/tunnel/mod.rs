//! Private-cluster tunnels.
//!
//! One tunnel per selected kubeconfig context. Each tunnel owns:
//!
//! - a `kubectl proxy` child ([`crate::supervisor`]),
//! - a local reverse HTTP server that forwards to that proxy ([`reverse`]),
//! - an outbound TLS leg to the relay that bridges raw bytes to the reverse
//!   server ([`client`]).
//!
//! [`controller`] wires those together and is the only entry point used by
//! the control API.

pub mod client;
pub mod controller;
pub mod reverse;

use std::fmt::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::TunnelRegistry;

/// Placeholder substituted with the tunnel id in the hostname template.
pub const ID_PLACEHOLDER: &str = "{{ID}}";

/// Length of derived tunnel ids; matches the identity frame width.
pub const TUNNEL_ID_LEN: usize = 32;

/// State of the `kubectl proxy` child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KubectlProxyStatus {
    Running,
    #[default]
    Stopped,
}

/// State of the relay leg only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelStatus {
    Connected,
    #[default]
    Disconnected,
}

/// Serializable summary of a configured tunnel. This is what gets persisted,
/// listed, and pushed to watchers; it never carries live handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRecord {
    pub id: String,
    pub context: String,
    /// Externally reachable URL of this cluster (hostname template with the id
    /// substituted). Older files call this `server`.
    #[serde(default, alias = "server")]
    pub server_address: String,
    /// Generated kubeconfig pointing `server_address` at `context`.
    #[serde(default)]
    pub kubeconfig_path: PathBuf,
    #[serde(default)]
    pub kubectl_proxy_status: KubectlProxyStatus,
    /// Last stderr output or spawn error of `kubectl proxy`, empty when clean.
    #[serde(default)]
    pub kubectl_proxy_error: String,
    #[serde(default)]
    pub tunnel_status: TunnelStatus,
}

impl TunnelRecord {
    /// A record with default statuses and nothing else filled in.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            context: String::new(),
            server_address: String::new(),
            kubeconfig_path: PathBuf::new(),
            kubectl_proxy_status: KubectlProxyStatus::default(),
            kubectl_proxy_error: String::new(),
            tunnel_status: TunnelStatus::default(),
        }
    }
}

/// Partial update merged over a [`TunnelRecord`] by
/// [`TunnelRegistry::upsert`]. `None` fields leave the record untouched.
#[derive(Debug, Clone, Default)]
pub struct TunnelPatch {
    pub context: Option<String>,
    pub server_address: Option<String>,
    pub kubeconfig_path: Option<PathBuf>,
    pub kubectl_proxy_status: Option<KubectlProxyStatus>,
    pub kubectl_proxy_error: Option<String>,
    pub tunnel_status: Option<TunnelStatus>,
    /// Transient: attached to the registry slot, never serialized.
    pub lifecycle: Option<std::sync::Arc<TunnelLifecycle>>,
}

impl TunnelPatch {
    pub fn kubectl_status(status: KubectlProxyStatus) -> Self {
        Self {
            kubectl_proxy_status: Some(status),
            ..Self::default()
        }
    }

    pub fn kubectl_error(message: impl Into<String>) -> Self {
        Self {
            kubectl_proxy_error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn tunnel_status(status: TunnelStatus) -> Self {
        Self {
            tunnel_status: Some(status),
            ..Self::default()
        }
    }

    /// Merge the data fields over `record`. The lifecycle handle is the
    /// registry's business and is not touched here.
    pub fn apply_to(&self, record: &mut TunnelRecord) {
        if let Some(ref v) = self.context {
            record.context.clone_from(v);
        }
        if let Some(ref v) = self.server_address {
            record.server_address.clone_from(v);
        }
        if let Some(ref v) = self.kubeconfig_path {
            record.kubeconfig_path.clone_from(v);
        }
        if let Some(v) = self.kubectl_proxy_status {
            record.kubectl_proxy_status = v;
        }
        if let Some(ref v) = self.kubectl_proxy_error {
            record.kubectl_proxy_error.clone_from(v);
        }
        if let Some(v) = self.tunnel_status {
            record.tunnel_status = v;
        }
    }
}

/// Process-wide relay settings, registered once by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// URL template containing a single `{{ID}}` placeholder.
    pub hostname_template: String,
    /// `host:port` of the relay server.
    pub relay_address: String,
}

impl RelayConfig {
    /// External address of tunnel `id`.
    pub fn server_address(&self, id: &str) -> String {
        self.hostname_template.replacen(ID_PLACEHOLDER, id, 1)
    }

    /// Deterministic id for `context` under this relay config.
    pub fn tunnel_id(&self, context: &str) -> String {
        derive_tunnel_id(&self.hostname_template, context)
    }
}

/// Lowercase hex of `sha256(template + context)`, truncated to
/// [`TUNNEL_ID_LEN`] characters. Stable across restarts, so a cluster keeps
/// its external URL.
pub fn derive_tunnel_id(hostname_template: &str, context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hostname_template.as_bytes());
    hasher.update(context.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(TUNNEL_ID_LEN);
    for byte in digest.iter().take(TUNNEL_ID_LEN / 2) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Transient per-tunnel handle held in the registry slot.
///
/// `exit` is the single cancellation point: every component of the tunnel
/// watches it. `teardown` is the task that, once `exit` fires, joins the
/// components in order and deletes the kubeconfig file.
#[derive(Debug)]
pub struct TunnelLifecycle {
    exit: CancellationToken,
    teardown: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelLifecycle {
    pub fn new(exit: CancellationToken) -> Self {
        Self {
            exit,
            teardown: Mutex::new(None),
        }
    }

    pub fn exit_token(&self) -> &CancellationToken {
        &self.exit
    }

    /// Fire the exit signal. Idempotent.
    pub fn fire_exit(&self) {
        self.exit.cancel();
    }

    pub async fn set_teardown(&self, handle: JoinHandle<()>) {
        *self.teardown.lock().await = Some(handle);
    }

    /// Fire the exit signal and wait until teardown has finished. Concurrent
    /// callers all return only once teardown is done.
    pub async fn shutdown(&self) {
        self.fire_exit();
        let mut teardown = self.teardown.lock().await;
        if let Some(handle) = teardown.as_mut() {
            let _ = handle.await;
            *teardown = None;
        }
    }
}

/// Handle given to tunnel components so they can publish status changes
/// without knowing about the registry's internals.
#[derive(Clone)]
pub struct StatusReporter {
    id: String,
    registry: TunnelRegistry,
}

impl StatusReporter {
    pub fn new(id: &str, registry: TunnelRegistry) -> Self {
        Self {
            id: id.to_string(),
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Merge `patch` into this tunnel's record. A no-op once the tunnel has
    /// been removed, so late events never resurrect it.
    pub async fn report(&self, patch: TunnelPatch) {
        self.registry.upsert(&self.id, patch, false).await;
    }
}
