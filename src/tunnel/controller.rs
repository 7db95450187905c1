//! Tunnel controller: the single entry point for creating and removing
//! tunnels.
//!
//! Per tunnel the lifecycle is
//!
//! ```text
//! Created -> spawning kubectl proxy -> awaiting ports -> bridging <-> reconnecting -> stopped
//! ```
//!
//! `start_*` writes the tunnel kubeconfig, binds the reverse server, records
//! the tunnel, and spawns one lifecycle task. That task starts the supervisor
//! and reverse server, waits for the first kubectl port, probes both ports,
//! and only then starts the relay client. Firing the tunnel's exit token
//! makes the task tear down, in order: relay client, reverse server,
//! `kubectl proxy`, kubeconfig file. [`TunnelController::stop_tunnel`] waits
//! for that and then removes the registry slot, which persists the removal.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reverse::ReverseServer;
use super::{
    client, KubectlProxyStatus, RelayConfig, StatusReporter, TunnelLifecycle, TunnelPatch,
    TunnelRecord, TunnelStatus, ID_PLACEHOLDER,
};
use crate::config::Config;
use crate::kubeconfig::{self, KubeconfigError};
use crate::registry::TunnelRegistry;
use crate::store::StateStore;
use crate::supervisor::{self, ProxyCommand};

/// Upper bound on a single readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum ControllerError {
    /// No relay config registered yet.
    RelayConfigMissing,
    /// Hostname template lacks the `{{ID}}` placeholder.
    InvalidTemplate(String),
    InvalidContext,
    Kubeconfig(KubeconfigError),
    /// Reverse server could not bind a loopback port.
    Bind(std::io::Error),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelayConfigMissing => write!(f, "Relay config has not been registered"),
            Self::InvalidTemplate(t) => {
                write!(f, "Hostname template must contain {ID_PLACEHOLDER}: {t}")
            }
            Self::InvalidContext => write!(f, "Context name must not be empty"),
            Self::Kubeconfig(e) => write!(f, "{e}"),
            Self::Bind(e) => write!(f, "Failed to bind reverse server: {e}"),
        }
    }
}

impl std::error::Error for ControllerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kubeconfig(e) => Some(e),
            Self::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KubeconfigError> for ControllerError {
    fn from(e: KubeconfigError) -> Self {
        Self::Kubeconfig(e)
    }
}

pub struct TunnelController {
    config: Arc<Config>,
    registry: TunnelRegistry,
    relay: OnceLock<RelayConfig>,
    /// Serializes registration so restoration runs exactly once.
    registering: Mutex<()>,
    /// One lock per tunnel id; start and stop of the same id never overlap.
    tunnel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    proxy_command: ProxyCommand,
}

impl TunnelController {
    pub fn new(config: Arc<Config>, registry: TunnelRegistry) -> Self {
        let proxy_command = ProxyCommand::kubectl(&config.kubectl.binary);
        Self {
            config,
            registry,
            relay: OnceLock::new(),
            registering: Mutex::new(()),
            tunnel_locks: Mutex::new(HashMap::new()),
            proxy_command,
        }
    }

    /// Replace how `kubectl proxy` is launched.
    pub fn with_proxy_command(mut self, command: ProxyCommand) -> Self {
        self.proxy_command = command;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn relay_config(&self) -> Option<&RelayConfig> {
        self.relay.get()
    }

    async fn lock_tunnel(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .tunnel_locks
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Set the process-wide relay config and restore persisted tunnels.
    ///
    /// Returns `Ok(true)` when this call registered the config, `Ok(false)`
    /// when one was already registered (the new one is ignored).
    pub async fn register_relay_config(
        &self,
        relay: RelayConfig,
    ) -> Result<bool, ControllerError> {
        if !relay.hostname_template.contains(ID_PLACEHOLDER) {
            return Err(ControllerError::InvalidTemplate(relay.hostname_template));
        }

        let _guard = self.registering.lock().await;
        if let Some(existing) = self.relay.get() {
            if *existing != relay {
                warn!(
                    template = %existing.hostname_template,
                    "Relay config already registered, ignoring new one"
                );
            }
            return Ok(false);
        }

        let store = StateStore::for_relay(&self.config.data_dir(), &relay.hostname_template)
            .with_legacy_path(self.config.legacy_state_file());
        let persisted = store.load().await;
        info!(
            template = %relay.hostname_template,
            relay = %relay.relay_address,
            path = %store.path().display(),
            restored = persisted.len(),
            "Relay config registered"
        );
        let _ = self.relay.set(relay);

        for record in persisted {
            if let Err(e) = self.start_with_id(&record.context, &record.id).await {
                warn!(tunnel = %record.id, context = %record.context, "Failed to restore tunnel: {e}");
            }
        }

        self.registry.attach_store(store).await;
        Ok(true)
    }

    /// Start a tunnel for `context` under the id derived from the relay
    /// config.
    pub async fn start_tunnel(&self, context: &str) -> Result<TunnelRecord, ControllerError> {
        let relay = self
            .relay
            .get()
            .ok_or(ControllerError::RelayConfigMissing)?;
        let id = relay.tunnel_id(context);
        self.start_with_id(context, &id).await
    }

    /// Start a tunnel for `context` under `id`. A live tunnel with the same id
    /// is torn down first.
    pub async fn start_with_id(
        &self,
        context: &str,
        id: &str,
    ) -> Result<TunnelRecord, ControllerError> {
        let relay = self
            .relay
            .get()
            .ok_or(ControllerError::RelayConfigMissing)?
            .clone();
        if context.trim().is_empty() {
            return Err(ControllerError::InvalidContext);
        }

        let _tunnel_guard = self.lock_tunnel(id).await;
        if let Some(existing) = self.registry.lifecycle(id).await {
            info!(tunnel = id, context, "Replacing running tunnel");
            existing.shutdown().await;
        }

        let server_address = relay.server_address(id);
        let doc = kubeconfig::for_tunnel(context, &server_address);
        let kubeconfig_path =
            kubeconfig::write_tunnel_file(&self.config.kubeconfig_dir(), id, &doc).await?;

        let reverse = match ReverseServer::bind().await {
            Ok(r) => r,
            Err(e) => {
                kubeconfig::remove_tunnel_file(&kubeconfig_path).await;
                return Err(ControllerError::Bind(e));
            }
        };

        let exit = CancellationToken::new();
        let lifecycle = Arc::new(TunnelLifecycle::new(exit.clone()));
        let record = self
            .registry
            .create(
                id,
                TunnelPatch {
                    context: Some(context.to_string()),
                    server_address: Some(server_address),
                    kubeconfig_path: Some(kubeconfig_path.clone()),
                    kubectl_proxy_status: Some(KubectlProxyStatus::Stopped),
                    kubectl_proxy_error: Some(String::new()),
                    tunnel_status: Some(TunnelStatus::Disconnected),
                    lifecycle: Some(lifecycle.clone()),
                },
            )
            .await;

        let task = TunnelTask {
            context: context.to_string(),
            relay,
            config: self.config.clone(),
            command: self.proxy_command.clone(),
            reporter: StatusReporter::new(id, self.registry.clone()),
            reverse,
            kubeconfig_path,
            exit,
        };
        lifecycle.set_teardown(tokio::spawn(task.run())).await;

        info!(tunnel = id, context, server = %record.server_address, "Tunnel created");
        Ok(record)
    }

    /// Tear down `id` and remove it from the registry. Returns whether it
    /// existed; unknown ids are a no-op.
    pub async fn stop_tunnel(&self, id: &str) -> bool {
        let _tunnel_guard = self.lock_tunnel(id).await;
        if let Some(lifecycle) = self.registry.lifecycle(id).await {
            lifecycle.shutdown().await;
        }
        let removed = self.registry.remove(id).await;
        if removed {
            info!(tunnel = id, "Tunnel removed");
        }
        removed
    }

    pub async fn list_tunnels(&self) -> Vec<TunnelRecord> {
        self.registry.list().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TunnelRecord>> {
        self.registry.subscribe()
    }

    /// Tear down every tunnel but keep the records, so they are restored on
    /// the next start.
    pub async fn shutdown_all(&self) {
        let lifecycles = self.registry.lifecycles().await;
        if lifecycles.is_empty() {
            return;
        }
        info!(count = lifecycles.len(), "Stopping all tunnels");
        futures::future::join_all(lifecycles.iter().map(|l| l.shutdown())).await;
    }
}

/// Everything the lifecycle task of one tunnel owns.
struct TunnelTask {
    context: String,
    relay: RelayConfig,
    config: Arc<Config>,
    command: ProxyCommand,
    reporter: StatusReporter,
    reverse: ReverseServer,
    kubeconfig_path: PathBuf,
    exit: CancellationToken,
}

impl TunnelTask {
    async fn run(self) {
        let tunnel = self.reporter.id().to_string();
        let tunnel = tunnel.as_str();

        // Teardown order is enforced with one token per component.
        let relay_stop = CancellationToken::new();
        let reverse_stop = CancellationToken::new();
        let kubectl_stop = CancellationToken::new();

        let (port_tx, mut port_rx) = watch::channel(None);
        let reverse_port = self.reverse.port();
        let reverse = self
            .reverse
            .spawn(tunnel, port_rx.clone(), reverse_stop.clone());
        let supervisor = tokio::spawn(supervisor::run(
            self.command,
            self.context.clone(),
            self.config.kubectl.restart_delay(),
            self.reporter.clone(),
            port_tx,
            kubectl_stop.clone(),
        ));

        let poll = self.config.relay.readiness_poll();
        let relay = if wait_until_ready(&mut port_rx, reverse_port, poll, &self.exit).await {
            info!(tunnel, reverse_port, "Tunnel ports ready, connecting relay");
            Some(tokio::spawn(client::run(
                self.relay,
                self.config.relay.clone(),
                reverse_port,
                self.reporter.clone(),
                relay_stop.clone(),
            )))
        } else {
            None
        };

        self.exit.cancelled().await;
        debug!(tunnel, "Tearing down tunnel");

        relay_stop.cancel();
        if let Some(relay) = relay {
            let _ = relay.await;
        }
        reverse_stop.cancel();
        let _ = reverse.await;
        kubectl_stop.cancel();
        let _ = supervisor.await;
        kubeconfig::remove_tunnel_file(&self.kubeconfig_path).await;

        info!(tunnel, context = %self.context, "Tunnel stopped");
    }
}

/// Wait for the first kubectl port, then poll until kubectl answers `GET /`
/// with 2xx and the reverse server accepts connections. `false` when `exit`
/// fires first.
async fn wait_until_ready(
    port_rx: &mut watch::Receiver<Option<u16>>,
    reverse_port: u16,
    poll: Duration,
    exit: &CancellationToken,
) -> bool {
    tokio::select! {
        () = exit.cancelled() => return false,
        announced = port_rx.wait_for(Option::is_some) => {
            if announced.is_err() {
                return false;
            }
        }
    }

    let probe: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    loop {
        let kubectl_port = *port_rx.borrow();
        if let Some(kubectl_port) = kubectl_port {
            if probe_http(&probe, kubectl_port).await && probe_tcp(reverse_port).await {
                return true;
            }
        }
        tokio::select! {
            () = exit.cancelled() => return false,
            () = tokio::time::sleep(poll) => {}
        }
    }
}

async fn probe_http(client: &Client<HttpConnector, Empty<Bytes>>, port: u16) -> bool {
    let Ok(uri) = format!("http://127.0.0.1:{port}/").parse::<Uri>() else {
        return false;
    };
    match tokio::time::timeout(PROBE_TIMEOUT, client.get(uri)).await {
        Ok(Ok(response)) => {
            let ok = response.status().is_success();
            if !ok {
                debug!(port, status = %response.status(), "kubectl proxy not ready");
            }
            ok
        }
        Ok(Err(e)) => {
            debug!(port, "kubectl proxy probe failed: {e}");
            false
        }
        Err(_) => false,
    }
}

async fn probe_tcp(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    const TEMPLATE: &str = "https://{{ID}}.relay.example.com";

    struct Fixture {
        dir: tempfile::TempDir,
        config: Arc<Config>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.data_dir = dir.path().join("data").to_string_lossy().into_owned();
        config.kubectl.kubeconfig_dir = dir.path().join("kube").to_string_lossy().into_owned();
        config.kubectl.restart_delay_ms = 100;
        config.relay.readiness_poll_ms = 20;
        config.relay.reconnect_initial_delay_ms = 20;
        config.relay.reconnect_max_delay_ms = 50;
        Fixture {
            dir,
            config: Arc::new(config),
        }
    }

    fn sh(script: &str) -> ProxyCommand {
        ProxyCommand {
            program: "/bin/sh".to_string(),
            leading_args: vec!["-c".to_string(), script.to_string(), "kubectl".to_string()],
        }
    }

    fn controller(fx: &Fixture, script: &str) -> TunnelController {
        TunnelController::new(fx.config.clone(), TunnelRegistry::new()).with_proxy_command(sh(script))
    }

    fn relay(address: &str) -> RelayConfig {
        RelayConfig {
            hostname_template: TEMPLATE.to_string(),
            relay_address: address.to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_requires_relay_config() {
        let fx = fixture();
        let ctl = controller(&fx, "exec sleep 30");
        assert!(matches!(
            ctl.start_tunnel("prod").await,
            Err(ControllerError::RelayConfigMissing)
        ));
        assert!(ctl.list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_template_without_placeholder_rejected() {
        let fx = fixture();
        let ctl = controller(&fx, "exec sleep 30");
        let bad = RelayConfig {
            hostname_template: "https://relay.example.com".into(),
            relay_address: "relay.example.com:443".into(),
        };
        assert!(matches!(
            ctl.register_relay_config(bad).await,
            Err(ControllerError::InvalidTemplate(_))
        ));
        assert!(ctl.relay_config().is_none());
    }

    #[tokio::test]
    async fn test_registration_is_first_wins() {
        let fx = fixture();
        let ctl = controller(&fx, "exec sleep 30");
        assert!(ctl.register_relay_config(relay("relay:443")).await.unwrap());
        let other = RelayConfig {
            hostname_template: "https://{{ID}}.other.example.com".into(),
            relay_address: "other:443".into(),
        };
        assert!(!ctl.register_relay_config(other).await.unwrap());
        assert_eq!(ctl.relay_config().unwrap().relay_address, "relay:443");
    }

    #[tokio::test]
    async fn test_start_records_tunnel_and_kubeconfig() {
        let fx = fixture();
        let ctl = controller(&fx, "exec sleep 30");
        ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap();

        let record = ctl.start_tunnel("prod").await.unwrap();
        let expected_id = derive(TEMPLATE, "prod");
        assert_eq!(record.id, expected_id);
        assert_eq!(record.context, "prod");
        assert_eq!(
            record.server_address,
            format!("https://{expected_id}.relay.example.com")
        );
        assert_eq!(record.kubectl_proxy_status, KubectlProxyStatus::Stopped);
        assert_eq!(record.tunnel_status, TunnelStatus::Disconnected);

        let doc = kubeconfig::load_from(&record.kubeconfig_path).await.unwrap();
        assert_eq!(doc.current_context, "prod");
        assert_eq!(doc.current_server(), Some(record.server_address.as_str()));

        assert_eq!(ctl.list_tunnels().await, vec![record.clone()]);

        // Persisted under the relay-scoped path.
        let store = StateStore::for_relay(&fx.config.data_dir(), TEMPLATE);
        assert!(store.load().await.iter().any(|r| r.id == expected_id));

        ctl.shutdown_all().await;
    }

    fn derive(template: &str, context: &str) -> String {
        crate::tunnel::derive_tunnel_id(template, context)
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_is_idempotent() {
        let fx = fixture();
        let ctl = controller(&fx, "exec sleep 30");
        ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap();
        let record = ctl.start_tunnel("prod").await.unwrap();
        assert!(record.kubeconfig_path.exists());

        assert!(ctl.stop_tunnel(&record.id).await);
        assert!(!record.kubeconfig_path.exists());
        assert!(ctl.list_tunnels().await.is_empty());
        assert!(!ctl.stop_tunnel(&record.id).await);
        assert!(!ctl.stop_tunnel("never-existed").await);

        let store = StateStore::for_relay(&fx.config.data_dir(), TEMPLATE);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_same_context_replaces_slot() {
        let fx = fixture();
        let ctl = controller(&fx, "exec sleep 30");
        ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap();
        let first = ctl.start_tunnel("prod").await.unwrap();
        let first_lifecycle = ctl.registry().lifecycle(&first.id).await.unwrap();

        let second = ctl.start_tunnel("prod").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first_lifecycle.exit_token().is_cancelled());
        assert_eq!(ctl.list_tunnels().await.len(), 1);
        assert!(second.kubeconfig_path.exists());

        ctl.shutdown_all().await;
    }

    fn pids_in(file: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(file)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn pid_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_concurrent_starts_leave_one_live_tunnel() {
        let fx = fixture();
        let pids = fx.dir.path().join("pids");
        let ctl = controller(
            &fx,
            &format!("echo $$ >> '{}'; exec sleep 30", pids.display()),
        );
        ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap();

        let (a, b) = tokio::join!(ctl.start_tunnel("prod"), ctl.start_tunnel("prod"));
        let id = a.unwrap().id;
        assert_eq!(b.unwrap().id, id);
        assert_eq!(ctl.list_tunnels().await.len(), 1);
        assert_eq!(ctl.registry().lifecycles().await.len(), 1);

        // Let the surviving tunnel spawn its kubectl.
        tokio::time::timeout(Duration::from_secs(5), async {
            while pids_in(&pids).is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(ctl.stop_tunnel(&id).await);
        let alive: Vec<String> = pids_in(&pids).into_iter().filter(|p| pid_alive(p)).collect();
        assert!(alive.is_empty(), "kubectl still running: {alive:?}");
    }

    #[tokio::test]
    async fn test_concurrent_stops_wait_for_teardown() {
        let fx = fixture();
        let ctl = controller(&fx, "exec sleep 30");
        ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap();
        let record = ctl.start_tunnel("prod").await.unwrap();
        let path = record.kubeconfig_path.clone();

        let first = async {
            let removed = ctl.stop_tunnel(&record.id).await;
            (removed, path.exists())
        };
        let second = async {
            let removed = ctl.stop_tunnel(&record.id).await;
            (removed, path.exists())
        };
        let ((removed_a, exists_a), (removed_b, exists_b)) = tokio::join!(first, second);

        assert!(removed_a ^ removed_b, "exactly one stop removes the tunnel");
        assert!(!exists_a);
        assert!(!exists_b);
        assert!(ctl.list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_registration_restores_persisted_tunnels() {
        let fx = fixture();
        let store = StateStore::for_relay(&fx.config.data_dir(), TEMPLATE);
        let mut persisted = TunnelRecord::new("restored-id");
        persisted.context = "staging".into();
        persisted.tunnel_status = TunnelStatus::Connected;
        store.save(&[persisted]).await;

        let ctl = controller(&fx, "exec sleep 30");
        ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap();

        let list = ctl.list_tunnels().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "restored-id");
        assert_eq!(list[0].context, "staging");
        assert_eq!(list[0].server_address, "https://restored-id.relay.example.com");
        assert_eq!(list[0].tunnel_status, TunnelStatus::Disconnected);
        assert!(ctl.registry().lifecycle("restored-id").await.is_some());

        ctl.shutdown_all().await;
        // Shutdown keeps records for the next start.
        assert!(store.load().await.iter().any(|r| r.id == "restored-id"));
    }

    #[tokio::test]
    async fn test_registration_migrates_legacy_dump() {
        let fx = fixture();
        std::fs::create_dir_all(fx.config.data_dir()).unwrap();
        let dump = serde_json::json!({
            TEMPLATE: [{"id": "legacy-id", "context": "prod", "server": "https://legacy-id.relay.example.com"}],
        });
        std::fs::write(fx.config.legacy_state_file(), dump.to_string()).unwrap();

        let ctl = controller(&fx, "exec sleep 30");
        ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap();

        let list = ctl.list_tunnels().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "legacy-id");

        let store = StateStore::for_relay(&fx.config.data_dir(), TEMPLATE);
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["tunnels"][0]["id"], "legacy-id");

        ctl.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_invalid_persisted_file_starts_empty() {
        let fx = fixture();
        let store = StateStore::for_relay(&fx.config.data_dir(), TEMPLATE);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{ definitely not json").unwrap();

        let ctl = controller(&fx, "exec sleep 30");
        assert!(ctl.register_relay_config(relay("127.0.0.1:1")).await.unwrap());
        assert!(ctl.list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_dialled_only_after_ports_ready() {
        let fx = fixture();

        // Fake kubectl proxy HTTP endpoint.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let app = Router::new().route("/", get(|| async { "{\"paths\":[]}" }));
        tokio::spawn(async move { axum::serve(upstream, app).await.unwrap() });

        // Stand-in relay: any inbound connection proves the relay leg started.
        let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay_listener.local_addr().unwrap().port();

        let gate = fx.dir.path().join("announce");
        let script = format!(
            "while [ ! -f '{}' ]; do sleep 0.05; done; echo 'Starting to serve on 127.0.0.1:{upstream_port}'; exec sleep 30",
            gate.display()
        );
        let ctl = controller(&fx, &script);
        ctl.register_relay_config(relay(&format!("127.0.0.1:{relay_port}")))
            .await
            .unwrap();
        let record = ctl.start_tunnel("prod").await.unwrap();

        // No port announced yet: relay must not be dialled.
        let early =
            tokio::time::timeout(Duration::from_millis(300), relay_listener.accept()).await;
        assert!(early.is_err());

        std::fs::write(&gate, "").unwrap();
        let accepted =
            tokio::time::timeout(Duration::from_secs(5), relay_listener.accept()).await;
        assert!(accepted.is_ok());

        let status = ctl.registry().get(&record.id).await.unwrap();
        assert_eq!(status.kubectl_proxy_status, KubectlProxyStatus::Running);

        assert!(ctl.stop_tunnel(&record.id).await);
    }
}
