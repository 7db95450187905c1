//! Kubeconfig documents.
//!
//! Two uses:
//!
//! - [`for_tunnel`] builds the minimal document handed to the control plane
//!   for each tunnel: one cluster whose `server` is the tunnel's external
//!   address, one context, `current-context` set, no user credentials.
//! - [`load_local`] reads the user's own kubeconfig (`$KUBECONFIG` or
//!   `~/.kube/config`) so the UI can offer its contexts.
//!
//! Only the fields this crate cares about are modelled; everything else in a
//! real kubeconfig is ignored on read.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::util::expand_tilde;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default)]
    pub current_context: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<NamedUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub server: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
}

/// Errors reading or writing kubeconfig files.
#[derive(Debug)]
pub enum KubeconfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_yaml::Error },
    Write { path: PathBuf, source: std::io::Error },
    Serialize(serde_yaml::Error),
}

impl fmt::Display for KubeconfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => {
                write!(f, "Failed to read kubeconfig {}: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "Failed to parse kubeconfig {}: {source}", path.display())
            }
            Self::Write { path, source } => {
                write!(f, "Failed to write kubeconfig {}: {source}", path.display())
            }
            Self::Serialize(e) => write!(f, "Failed to serialize kubeconfig: {e}"),
        }
    }
}

impl std::error::Error for KubeconfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Serialize(e) => Some(e),
        }
    }
}

impl KubeConfig {
    /// Names of all contexts, in file order.
    pub fn context_names(&self) -> Vec<&str> {
        self.contexts.iter().map(|c| c.name.as_str()).collect()
    }

    /// `server` of the cluster the current context points at.
    pub fn current_server(&self) -> Option<&str> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)?;
        self.clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| c.cluster.server.as_str())
    }

    pub fn to_yaml(&self) -> Result<String, KubeconfigError> {
        serde_yaml::to_string(self).map_err(KubeconfigError::Serialize)
    }
}

/// Minimal document exposing `server` under the name `context`.
pub fn for_tunnel(context: &str, server: &str) -> KubeConfig {
    KubeConfig {
        api_version: "v1".to_string(),
        kind: None,
        clusters: vec![NamedCluster {
            name: context.to_string(),
            cluster: Cluster {
                server: server.to_string(),
            },
        }],
        contexts: vec![NamedContext {
            name: context.to_string(),
            context: Context {
                cluster: context.to_string(),
                user: None,
                namespace: Some("default".to_string()),
            },
        }],
        current_context: context.to_string(),
        users: Vec::new(),
    }
}

/// Write `doc` to `<dir>/clusterlink-<id>.kubeconfig`, readable by the owner
/// only. Returns the file path.
pub async fn write_tunnel_file(
    dir: &Path,
    id: &str,
    doc: &KubeConfig,
) -> Result<PathBuf, KubeconfigError> {
    let path = dir.join(format!("clusterlink-{id}.kubeconfig"));
    let yaml = doc.to_yaml()?;
    let write_err = |source| KubeconfigError::Write {
        path: path.clone(),
        source,
    };

    tokio::fs::create_dir_all(dir).await.map_err(write_err)?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&path).await.map_err(write_err)?;
    file.write_all(yaml.as_bytes()).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;

    debug!(path = %path.display(), "Wrote tunnel kubeconfig");
    Ok(path)
}

/// Delete a tunnel kubeconfig. Already-missing files are fine.
pub async fn remove_tunnel_file(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed tunnel kubeconfig"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Failed to remove tunnel kubeconfig: {e}"),
    }
}

/// Path of the user's kubeconfig: first entry of `$KUBECONFIG`, else
/// `~/.kube/config`.
pub fn local_path() -> PathBuf {
    if let Ok(value) = std::env::var("KUBECONFIG") {
        if let Some(first) = std::env::split_paths(&value).find(|p| !p.as_os_str().is_empty()) {
            return first;
        }
    }
    expand_tilde("~/.kube/config")
}

/// Read and parse the user's kubeconfig.
pub async fn load_local() -> Result<KubeConfig, KubeconfigError> {
    load_from(&local_path()).await
}

pub async fn load_from(path: &Path) -> Result<KubeConfig, KubeconfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| KubeconfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_yaml::from_str(&content).map_err(|source| KubeconfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_tunnel_shape() {
        let doc = for_tunnel("prod", "https://abc.relay.example.com");
        let yaml = doc.to_yaml().unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(value["apiVersion"].as_str(), Some("v1"));
        assert_eq!(value["current-context"].as_str(), Some("prod"));
        assert_eq!(
            value["clusters"][0]["cluster"]["server"].as_str(),
            Some("https://abc.relay.example.com")
        );
        assert_eq!(value["contexts"][0]["context"]["cluster"].as_str(), Some("prod"));
        assert_eq!(value["contexts"][0]["context"]["namespace"].as_str(), Some("default"));
        assert!(value.get("users").is_none());
        assert_eq!(doc.current_server(), Some("https://abc.relay.example.com"));
    }

    #[test]
    fn test_parse_real_world_kubeconfig() {
        let yaml = r"
apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTg==
    server: https://10.0.0.1:6443
  name: kind-dev
- cluster:
    server: https://prod.internal:6443
  name: prod
contexts:
- context:
    cluster: kind-dev
    user: kind-dev
  name: kind-dev
- context:
    cluster: prod
    user: admin
    namespace: apps
  name: prod
current-context: prod
users:
- name: kind-dev
  user:
    client-certificate-data: LS0t
- name: admin
  user:
    token: secret
";
        let doc: KubeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.context_names(), vec!["kind-dev", "prod"]);
        assert_eq!(doc.current_server(), Some("https://prod.internal:6443"));
        assert_eq!(doc.users.len(), 2);
        assert_eq!(doc.contexts[1].context.namespace.as_deref(), Some("apps"));
    }

    #[tokio::test]
    async fn test_write_and_remove_tunnel_file() {
        let dir = tempfile::tempdir().unwrap();
        let doc = for_tunnel("prod", "https://t1.example.com");
        let path = write_tunnel_file(dir.path(), "t1", &doc).await.unwrap();

        let loaded = load_from(&path).await.unwrap();
        assert_eq!(loaded, doc);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        remove_tunnel_file(&path).await;
        assert!(!path.exists());
        remove_tunnel_file(&path).await;
    }

    #[tokio::test]
    async fn test_load_from_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            load_from(&missing).await,
            Err(KubeconfigError::Read { .. })
        ));

        let bad = dir.path().join("bad");
        std::fs::write(&bad, "clusters: [unterminated").unwrap();
        assert!(matches!(
            load_from(&bad).await,
            Err(KubeconfigError::Parse { .. })
        ));
    }
}
