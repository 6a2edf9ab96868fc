//! Process-wide registry of volumes published on this node.
//!
//! The registry holds the desired state the publish handler has accepted
//! and the mount supervisor reconciles against. It also tracks which
//! volumes currently have a repair task in flight so that at most one
//! repair runs per volume.

use std::collections::{HashMap, HashSet};

use tokio::sync::{Mutex, RwLock};

use crate::volume::VolumeState;

/// Registry of published volumes plus the set of volumes under repair.
///
/// When both locks are needed, `volumes` is always acquired before
/// `repairing`.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    pub(crate) volumes: RwLock<HashMap<String, VolumeState>>,
    repairing: Mutex<HashSet<String>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a copy of a volume's record.
    pub async fn get(&self, volume_id: &str) -> Option<VolumeState> {
        self.volumes.read().await.get(volume_id).cloned()
    }

    /// Insert or replace a volume's record.
    pub async fn put(&self, vol: VolumeState) {
        self.volumes.write().await.insert(vol.volume_id.clone(), vol);
    }

    /// Remove a volume's record, returning it if it was present.
    pub async fn delete(&self, volume_id: &str) -> Option<VolumeState> {
        self.volumes.write().await.remove(volume_id)
    }

    /// Clone a consistent view of all records.
    ///
    /// The supervisor iterates the snapshot instead of the map itself so
    /// the read lock is released before any slow work starts.
    pub async fn snapshot(&self) -> Vec<VolumeState> {
        self.volumes.read().await.values().cloned().collect()
    }

    /// Number of volumes currently tracked.
    pub async fn len(&self) -> usize {
        self.volumes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.volumes.read().await.is_empty()
    }

    /// Mark a volume as having a repair in flight.
    ///
    /// Returns false when a repair is already running for it, in which
    /// case the caller must not spawn another one.
    pub async fn mark_repairing(&self, volume_id: &str) -> bool {
        self.repairing.lock().await.insert(volume_id.to_string())
    }

    /// Clear the in-flight repair marker. Called on every repair exit path.
    pub async fn clear_repairing(&self, volume_id: &str) {
        self.repairing.lock().await.remove(volume_id);
    }

    /// Whether a repair is currently in flight for the volume.
    pub async fn is_repairing(&self, volume_id: &str) -> bool {
        self.repairing.lock().await.contains(volume_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(id: &str) -> VolumeState {
        VolumeState {
            volume_id: id.to_string(),
            mount_path: format!("/mnt/{id}"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let registry = VolumeRegistry::new();
        assert!(registry.get("pvc-1").await.is_none());

        registry.put(vol("pvc-1")).await;
        assert_eq!(registry.get("pvc-1").await.unwrap().mount_path, "/mnt/pvc-1");
        assert_eq!(registry.len().await, 1);

        assert!(registry.delete("pvc-1").await.is_some());
        assert!(registry.delete("pvc-1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_returns_all_records() {
        let registry = VolumeRegistry::new();
        registry.put(vol("pvc-1")).await;
        registry.put(vol("pvc-2")).await;

        let mut ids: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|v| v.volume_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["pvc-1".to_string(), "pvc-2".to_string()]);
    }

    #[tokio::test]
    async fn mark_repairing_is_exclusive_until_cleared() {
        let registry = VolumeRegistry::new();

        assert!(registry.mark_repairing("pvc-1").await);
        assert!(!registry.mark_repairing("pvc-1").await);
        assert!(registry.is_repairing("pvc-1").await);

        // An unrelated volume is not affected.
        assert!(registry.mark_repairing("pvc-2").await);

        registry.clear_repairing("pvc-1").await;
        assert!(!registry.is_repairing("pvc-1").await);
        assert!(registry.mark_repairing("pvc-1").await);
    }
}
