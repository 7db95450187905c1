//! Durable tunnel registry snapshot.
//!
//! One JSON file per relay config under the data directory:
//!
//! ```text
//! <data_dir>/tunnels-<sha256(hostname_template)[..16]>.json
//! ```
//!
//! Current layout (version 1):
//!
//! ```json
//! {"version": 1, "hostnameTemplate": "https://{{ID}}.relay.example.com", "tunnels": [ ... ]}
//! ```
//!
//! Earlier revisions wrote either a bare array of records or an object keyed
//! by hostname template into a single unscoped file. Both layouts are still
//! read, and when the scoped file does not exist yet the legacy file (see
//! [`StateStore::with_legacy_path`]) is loaded instead. The next save writes
//! the current layout to the scoped path. Anything unreadable loads as an
//! empty registry.
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! canonical path, so the file is never partially overwritten. Write errors
//! are logged and swallowed: the in-memory registry stays authoritative and the
//! next successful save catches up.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::tunnel::TunnelRecord;

/// On-disk schema version written by [`StateStore::save`].
pub const SCHEMA_VERSION: u32 = 1;

/// Disambiguates temp files when two saves overlap in one process.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRef<'a> {
    version: u32,
    hostname_template: &'a str,
    tunnels: &'a [TunnelRecord],
}

#[derive(Deserialize)]
struct Versioned {
    version: u32,
    #[serde(default)]
    tunnels: Vec<TunnelRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PersistedFile {
    Versioned(Versioned),
    List(Vec<TunnelRecord>),
    ByTemplate(HashMap<String, Vec<TunnelRecord>>),
}

/// Reads and atomically replaces the persisted snapshot for one relay config.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    legacy_path: Option<PathBuf>,
    hostname_template: String,
}

impl StateStore {
    /// Store scoped to `hostname_template` inside `data_dir`.
    pub fn for_relay(data_dir: &Path, hostname_template: &str) -> Self {
        let digest = Sha256::digest(hostname_template.as_bytes());
        let mut scope = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            let _ = write!(scope, "{byte:02x}");
        }
        Self {
            path: data_dir.join(format!("tunnels-{scope}.json")),
            legacy_path: None,
            hostname_template: hostname_template.to_string(),
        }
    }

    /// Read from `path` when the scoped file is missing.
    pub fn with_legacy_path(mut self, path: PathBuf) -> Self {
        self.legacy_path = Some(path);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted records in file order, first occurrence of an id wins.
    /// Missing, unreadable, or malformed files yield an empty list.
    pub async fn load(&self) -> Vec<TunnelRecord> {
        match read_if_exists(&self.path).await {
            Some(bytes) => self.parse(&self.path, &bytes),
            None => match self.legacy_path {
                Some(ref legacy) => match read_if_exists(legacy).await {
                    Some(bytes) => {
                        let records = self.parse(legacy, &bytes);
                        info!(
                            path = %legacy.display(),
                            count = records.len(),
                            "Loaded tunnels from legacy file"
                        );
                        records
                    }
                    None => Vec::new(),
                },
                None => Vec::new(),
            },
        }
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Vec<TunnelRecord> {
        let records = match serde_json::from_slice::<PersistedFile>(bytes) {
            Ok(PersistedFile::Versioned(v)) if v.version == SCHEMA_VERSION => v.tunnels,
            Ok(PersistedFile::Versioned(v)) => {
                warn!(
                    path = %path.display(),
                    "Unsupported tunnel file version {}, starting empty", v.version
                );
                Vec::new()
            }
            Ok(PersistedFile::List(list)) => list,
            Ok(PersistedFile::ByTemplate(mut by_template)) => by_template
                .remove(&self.hostname_template)
                .unwrap_or_default(),
            Err(e) => {
                warn!(path = %path.display(), "Malformed tunnel file, starting empty: {e}");
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        records
            .into_iter()
            .filter(|r| !r.id.is_empty() && seen.insert(r.id.clone()))
            .collect()
    }

    /// Persist the full snapshot. Never fails the caller.
    pub async fn save(&self, snapshot: &[TunnelRecord]) {
        if let Err(e) = self.try_save(snapshot).await {
            warn!(path = %self.path.display(), "Failed to persist tunnels: {e}");
        }
    }

    async fn try_save(&self, snapshot: &[TunnelRecord]) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(&PersistedRef {
            version: SCHEMA_VERSION,
            hostname_template: &self.hostname_template,
            tunnels: snapshot,
        })?;

        let parent = self.path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = parent.join(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));

        let written = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
        debug!(path = %self.path.display(), count = snapshot.len(), "Persisted tunnels");
        Ok(())
    }
}

async fn read_if_exists(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(b) => Some(b),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No persisted tunnels");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), "Failed to read persisted tunnels: {e}");
            None
        }
    }
}
