//! In-memory authoritative list of configured tunnels.
//!
//! Every mutation goes through [`TunnelRegistry::upsert`], [`TunnelRegistry::create`] or
//! [`TunnelRegistry::remove`]. All run under one async mutex and, before
//! releasing it, re-derive the serializable snapshot, broadcast it to
//! watchers, and hand it to the [`StateStore`]. Holding the lock across the
//! save keeps snapshot pushes and file writes in mutation order.
//!
//! Cloneable: all clones share the same inner state.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::store::StateStore;
use crate::tunnel::{TunnelLifecycle, TunnelPatch, TunnelRecord};

/// Capacity of the snapshot broadcast channel. Slow watchers lag and skip to
/// the newest snapshot.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

struct RegistryEntry {
    record: TunnelRecord,
    lifecycle: Option<Arc<TunnelLifecycle>>,
}

struct RegistryInner {
    entries: Vec<RegistryEntry>,
    store: Option<StateStore>,
}

#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    snapshots: broadcast::Sender<Vec<TunnelRecord>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                entries: Vec::new(),
                store: None,
            })),
            snapshots,
        }
    }

    /// Receive a snapshot after every mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TunnelRecord>> {
        self.snapshots.subscribe()
    }

    /// Start persisting to `store` and write the current snapshot to it.
    /// Called once, when the relay config is registered.
    pub async fn attach_store(&self, store: StateStore) {
        let mut inner = self.inner.lock().await;
        store.save(&Self::snapshot(&inner)).await;
        inner.store = Some(store);
    }

    /// Merge `patch` into the record for `id`.
    ///
    /// When the record is missing it is created from default statuses if
    /// `create_if_missing` is set; otherwise the call is a no-op and returns
    /// `None` (late status reports for a removed tunnel land here).
    pub async fn upsert(
        &self,
        id: &str,
        patch: TunnelPatch,
        create_if_missing: bool,
    ) -> Option<TunnelRecord> {
        let mut inner = self.inner.lock().await;
        let index = match inner.entries.iter().position(|e| e.record.id == id) {
            Some(i) => i,
            None if create_if_missing => Self::push_default(&mut inner, id),
            None => return None,
        };
        let updated = Self::apply(&mut inner, index, patch);
        self.publish(&inner).await;
        Some(updated)
    }

    /// Create-or-merge; always yields the resulting record.
    pub async fn create(&self, id: &str, patch: TunnelPatch) -> TunnelRecord {
        let mut inner = self.inner.lock().await;
        let index = inner
            .entries
            .iter()
            .position(|e| e.record.id == id)
            .unwrap_or_else(|| Self::push_default(&mut inner, id));
        let updated = Self::apply(&mut inner, index, patch);
        self.publish(&inner).await;
        updated
    }

    fn push_default(inner: &mut RegistryInner, id: &str) -> usize {
        debug!(tunnel = id, "Registry create");
        inner.entries.push(RegistryEntry {
            record: TunnelRecord::new(id),
            lifecycle: None,
        });
        inner.entries.len() - 1
    }

    fn apply(inner: &mut RegistryInner, index: usize, patch: TunnelPatch) -> TunnelRecord {
        let entry = &mut inner.entries[index];
        patch.apply_to(&mut entry.record);
        if let Some(lifecycle) = patch.lifecycle {
            // A replaced handle would otherwise be unreachable and never stop.
            if let Some(previous) = entry.lifecycle.as_ref() {
                if !Arc::ptr_eq(previous, &lifecycle) {
                    previous.fire_exit();
                }
            }
            entry.lifecycle = Some(lifecycle);
        }
        entry.record.clone()
    }

    /// Remove `id`, firing its exit signal first. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.entries.iter().position(|e| e.record.id == id) else {
            return false;
        };

        debug!(tunnel = id, "Registry remove");
        let entry = inner.entries.remove(index);
        if let Some(lifecycle) = entry.lifecycle {
            lifecycle.fire_exit();
        }

        self.publish(&inner).await;
        true
    }

    /// Current snapshot. Callers get an owned copy.
    pub async fn list(&self) -> Vec<TunnelRecord> {
        Self::snapshot(&*self.inner.lock().await)
    }

    pub async fn get(&self, id: &str) -> Option<TunnelRecord> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.record.id == id)
            .map(|e| e.record.clone())
    }

    /// Live handle of `id`, if the tunnel is running.
    pub async fn lifecycle(&self, id: &str) -> Option<Arc<TunnelLifecycle>> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.record.id == id)
            .and_then(|e| e.lifecycle.clone())
    }

    /// All live handles, for process shutdown.
    pub async fn lifecycles(&self) -> Vec<Arc<TunnelLifecycle>> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter_map(|e| e.lifecycle.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn snapshot(inner: &RegistryInner) -> Vec<TunnelRecord> {
        inner.entries.iter().map(|e| e.record.clone()).collect()
    }

    async fn publish(&self, inner: &RegistryInner) {
        let snapshot = Self::snapshot(inner);
        // No receivers is fine: nobody is watching yet.
        let _ = self.snapshots.send(snapshot.clone());
        if let Some(ref store) = inner.store {
            store.save(&snapshot).await;
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{KubectlProxyStatus, TunnelStatus};
    use tokio_util::sync::CancellationToken;

    fn create_patch(context: &str) -> TunnelPatch {
        TunnelPatch {
            context: Some(context.to_string()),
            ..TunnelPatch::default()
        }
    }

    #[tokio::test]
    async fn test_create_uses_default_statuses() {
        let registry = TunnelRegistry::new();
        let record = registry.upsert("t1", create_patch("prod"), true).await.unwrap();
        assert_eq!(record.context, "prod");
        assert_eq!(record.kubectl_proxy_status, KubectlProxyStatus::Stopped);
        assert_eq!(record.kubectl_proxy_error, "");
        assert_eq!(record.tunnel_status, TunnelStatus::Disconnected);
        assert_eq!(registry.list().await, vec![record]);
    }

    #[tokio::test]
    async fn test_create_merges_into_existing_slot() {
        let registry = TunnelRegistry::new();
        registry.create("t1", create_patch("prod")).await;
        registry
            .upsert("t1", TunnelPatch::tunnel_status(TunnelStatus::Connected), false)
            .await;
        let record = registry
            .create(
                "t1",
                TunnelPatch {
                    tunnel_status: Some(TunnelStatus::Disconnected),
                    ..create_patch("staging")
                },
            )
            .await;
        assert_eq!(record.context, "staging");
        assert_eq!(record.tunnel_status, TunnelStatus::Disconnected);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_upsert_without_create_ignores_missing() {
        let registry = TunnelRegistry::new();
        let result = registry
            .upsert("ghost", TunnelPatch::tunnel_status(TunnelStatus::Connected), false)
            .await;
        assert!(result.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_upsert_merges_and_keeps_single_slot() {
        let registry = TunnelRegistry::new();
        registry.upsert("t1", create_patch("prod"), true).await;
        registry
            .upsert("t1", TunnelPatch::kubectl_status(KubectlProxyStatus::Running), true)
            .await;
        registry
            .upsert("t1", TunnelPatch::kubectl_error("boom"), false)
            .await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].context, "prod");
        assert_eq!(list[0].kubectl_proxy_status, KubectlProxyStatus::Running);
        assert_eq!(list[0].kubectl_proxy_error, "boom");
    }

    #[tokio::test]
    async fn test_every_mutation_is_pushed_in_order() {
        let registry = TunnelRegistry::new();
        let mut rx = registry.subscribe();

        registry.upsert("t1", create_patch("prod"), true).await;
        registry
            .upsert("t1", TunnelPatch::tunnel_status(TunnelStatus::Connected), false)
            .await;
        registry.remove("t1").await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first[0].tunnel_status, TunnelStatus::Disconnected);
        let second = rx.recv().await.unwrap();
        assert_eq!(second[0].tunnel_status, TunnelStatus::Connected);
        let third = rx.recv().await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_remove_fires_exit_and_is_idempotent() {
        let registry = TunnelRegistry::new();
        let lifecycle = Arc::new(TunnelLifecycle::new(CancellationToken::new()));
        let patch = TunnelPatch {
            lifecycle: Some(lifecycle.clone()),
            ..create_patch("prod")
        };
        registry.upsert("t1", patch, true).await;
        assert!(registry.lifecycle("t1").await.is_some());

        assert!(registry.remove("t1").await);
        assert!(lifecycle.exit_token().is_cancelled());
        assert!(!registry.remove("t1").await);
        assert!(registry.get("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_replacing_lifecycle_fires_previous_exit() {
        let registry = TunnelRegistry::new();
        let old = Arc::new(TunnelLifecycle::new(CancellationToken::new()));
        let new = Arc::new(TunnelLifecycle::new(CancellationToken::new()));
        registry
            .create(
                "t1",
                TunnelPatch {
                    lifecycle: Some(old.clone()),
                    ..create_patch("prod")
                },
            )
            .await;
        registry
            .create(
                "t1",
                TunnelPatch {
                    lifecycle: Some(new.clone()),
                    ..create_patch("prod")
                },
            )
            .await;

        assert!(old.exit_token().is_cancelled());
        assert!(!new.exit_token().is_cancelled());
        let live = registry.lifecycle("t1").await.unwrap();
        assert!(Arc::ptr_eq(&live, &new));
    }

    #[tokio::test]
    async fn test_mutations_persist_without_transient_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::for_relay(dir.path(), "https://{{ID}}.example.com");
        let registry = TunnelRegistry::new();
        registry.attach_store(store.clone()).await;

        let patch = TunnelPatch {
            lifecycle: Some(Arc::new(TunnelLifecycle::new(CancellationToken::new()))),
            ..create_patch("prod")
        };
        registry.upsert("t1", patch, true).await;
        registry
            .upsert("t1", TunnelPatch::kubectl_status(KubectlProxyStatus::Running), false)
            .await;

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("lifecycle"));
        let loaded = store.load().await;
        assert_eq!(loaded, vec![registry.get("t1").await.unwrap()]);

        registry.remove("t1").await;
        assert!(store.load().await.is_empty());
    }
}
