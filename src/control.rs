//! Client for the orchestrator-side control plane.
//!
//! The node plugin needs three things from the cluster: the iSCSI
//! parameters recorded on the persistent volume, the volume's health as
//! reported by the storage control plane, and the per-volume ownership
//! record that tells the iSCSI target which node may log in. All three are
//! served by the maya API endpoint resolved at startup.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::Status;

/// Per-call timeout towards the control plane.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Volume parameters recorded on the persistent volume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeDetails {
    pub name: String,
    pub capacity: String,
    #[serde(rename = "fsType")]
    pub fs_type: String,
    #[serde(rename = "accessModes", default)]
    pub access_modes: Vec<String>,
    #[serde(rename = "targetPortal")]
    pub target_portal: String,
    pub iqn: String,
    #[serde(default)]
    pub lun: i32,
    #[serde(rename = "iscsiInterface", default)]
    pub iscsi_interface: String,
}

/// Health of a volume as reported by the control plane.
///
/// Only `Healthy` and `Degraded` admit I/O; everything else keeps the
/// readiness prober waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeStatus {
    Healthy,
    Degraded,
    Offline,
    Unknown(String),
}

impl VolumeStatus {
    /// Whether the volume can serve reads and writes in this state.
    pub fn admits_io(&self) -> bool {
        matches!(self, VolumeStatus::Healthy | VolumeStatus::Degraded)
    }
}

impl From<&str> for VolumeStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "Healthy" => VolumeStatus::Healthy,
            "Degraded" => VolumeStatus::Degraded,
            "Offline" => VolumeStatus::Offline,
            other => VolumeStatus::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeStatus::Healthy => f.write_str("Healthy"),
            VolumeStatus::Degraded => f.write_str("Degraded"),
            VolumeStatus::Offline => f.write_str("Offline"),
            VolumeStatus::Unknown(other) => f.write_str(other),
        }
    }
}

/// Declares which node currently owns a volume.
///
/// The iSCSI target consults this record and rejects logins from any
/// other node, so the record doubles as the cross-node fencing point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "ownerNodeId")]
    pub owner_node_id: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl OwnershipRecord {
    pub fn new(volume_id: &str, owner_node_id: &str, mount_path: &str) -> Self {
        OwnershipRecord {
            volume_id: volume_id.to_string(),
            owner_node_id: owner_node_id.to_string(),
            mount_path: mount_path.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<ControlPlaneError> for Status {
    fn from(error: ControlPlaneError) -> Self {
        Status::internal(error.to_string())
    }
}

/// Interface to the orchestrator metadata store.
///
/// The node handlers and the mount supervisor only depend on this trait;
/// the concrete REST client below is wired in at startup.
#[tonic::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Look up the volume parameters recorded on the persistent volume.
    async fn volume_details(&self, volume_id: &str) -> Result<VolumeDetails, ControlPlaneError>;

    /// Current health of the volume.
    async fn volume_status(&self, volume_id: &str) -> Result<VolumeStatus, ControlPlaneError>;

    /// Fetch the current ownership record, if one exists.
    async fn ownership(&self, volume_id: &str)
        -> Result<Option<OwnershipRecord>, ControlPlaneError>;

    /// Claim ownership of a volume for a node. Claiming again for the
    /// same node replaces the record, which keeps retries idempotent.
    async fn claim_ownership(&self, record: &OwnershipRecord) -> Result<(), ControlPlaneError>;

    /// Drop the ownership record. Releasing an absent record succeeds.
    async fn release_ownership(&self, volume_id: &str) -> Result<(), ControlPlaneError>;
}

/// REST client for the maya API endpoint.
pub struct MapiClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct VolumeStatusBody {
    status: String,
}

impl MapiClient {
    /// Create a client against a resolved `http://host:port` endpoint.
    pub fn new(base_url: String) -> Result<Self, ControlPlaneError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(MapiClient { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn api_error(response: reqwest::Response) -> ControlPlaneError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        ControlPlaneError::Api { status, message }
    }
}

#[tonic::async_trait]
impl ControlPlane for MapiClient {
    async fn volume_details(&self, volume_id: &str) -> Result<VolumeDetails, ControlPlaneError> {
        let response = self
            .client
            .get(self.url(&format!("/latest/volumes/{volume_id}")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn volume_status(&self, volume_id: &str) -> Result<VolumeStatus, ControlPlaneError> {
        let response = self
            .client
            .get(self.url(&format!("/latest/volumes/{volume_id}/status")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let body: VolumeStatusBody = response.json().await?;
        Ok(VolumeStatus::from(body.status.as_str()))
    }

    async fn ownership(
        &self,
        volume_id: &str,
    ) -> Result<Option<OwnershipRecord>, ControlPlaneError> {
        let response = self
            .client
            .get(self.url(&format!("/latest/ownerships/{volume_id}")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn claim_ownership(&self, record: &OwnershipRecord) -> Result<(), ControlPlaneError> {
        let response = self
            .client
            .put(self.url(&format!("/latest/ownerships/{}", record.volume_id)))
            .json(record)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(())
    }

    async fn release_ownership(&self, volume_id: &str) -> Result<(), ControlPlaneError> {
        let response = self
            .client
            .delete(self.url(&format!("/latest/ownerships/{volume_id}")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(())
    }
}

/// In-memory control plane used by the unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeControlPlane {
        pub(crate) details: Mutex<HashMap<String, VolumeDetails>>,
        pub(crate) statuses: Mutex<HashMap<String, VolumeStatus>>,
        pub(crate) ownerships: Mutex<HashMap<String, OwnershipRecord>>,
        pub(crate) claims: AtomicUsize,
        pub(crate) releases: AtomicUsize,
        /// Artificial delay before each status probe, used to hold a
        /// repair worker inside its readiness wait.
        status_delay: std::sync::Mutex<Option<Duration>>,
    }

    impl FakeControlPlane {
        pub(crate) fn with_volume(volume_id: &str) -> Self {
            let fake = FakeControlPlane::default();
            let details = VolumeDetails {
                name: volume_id.to_string(),
                capacity: "5G".into(),
                fs_type: "ext4".into(),
                access_modes: vec!["ReadWriteOnce".into()],
                target_portal: "127.0.0.1:3260".into(),
                iqn: format!("iqn.2016-09.com.openebs.jiva:{volume_id}"),
                lun: 0,
                iscsi_interface: "default".into(),
            };
            fake.details
                .try_lock()
                .unwrap()
                .insert(volume_id.to_string(), details);
            fake.statuses
                .try_lock()
                .unwrap()
                .insert(volume_id.to_string(), VolumeStatus::Healthy);
            fake
        }

        pub(crate) fn set_status_delay(&self, delay: Duration) {
            *self.status_delay.lock().unwrap() = Some(delay);
        }

        pub(crate) fn claim_count(&self) -> usize {
            self.claims.load(Ordering::SeqCst)
        }

        pub(crate) fn release_count(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    #[tonic::async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn volume_details(
            &self,
            volume_id: &str,
        ) -> Result<VolumeDetails, ControlPlaneError> {
            self.details
                .lock()
                .await
                .get(volume_id)
                .cloned()
                .ok_or(ControlPlaneError::Api {
                    status: 404,
                    message: format!("volume {volume_id} not found"),
                })
        }

        async fn volume_status(&self, volume_id: &str) -> Result<VolumeStatus, ControlPlaneError> {
            let delay = *self.status_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .statuses
                .lock()
                .await
                .get(volume_id)
                .cloned()
                .unwrap_or(VolumeStatus::Unknown("missing".into())))
        }

        async fn ownership(
            &self,
            volume_id: &str,
        ) -> Result<Option<OwnershipRecord>, ControlPlaneError> {
            Ok(self.ownerships.lock().await.get(volume_id).cloned())
        }

        async fn claim_ownership(&self, record: &OwnershipRecord) -> Result<(), ControlPlaneError> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            self.ownerships
                .lock()
                .await
                .insert(record.volume_id.clone(), record.clone());
            Ok(())
        }

        async fn release_ownership(&self, volume_id: &str) -> Result<(), ControlPlaneError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.ownerships.lock().await.remove(volume_id);
            Ok(())
        }
    }
}
