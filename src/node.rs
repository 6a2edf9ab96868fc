//! CSI node service.
//!
//! Implements the node verbs on top of the volume registry, the control
//! plane and the iSCSI adapter. Publish and unpublish form a small state
//! machine per volume: a registry record is created when a publish is
//! admitted, its device path is set when the first mount completes, and
//! the record disappears when the volume is unpublished. Everything else
//! keys off that record.

use std::sync::Arc;

use tonic::Status;
use tracing::{error, info, warn};

use crate::control::{ControlPlane, OwnershipRecord};
use crate::csi::*;
use crate::iscsi::IscsiClient;
use crate::metrics::OperationTimer;
use crate::mount;
use crate::readiness::{self, ProbeConfig};
use crate::registry::VolumeRegistry;
use crate::volume::VolumeState;
use crate::{metrics, DRIVER_NAME};

/// The CSI node service for this node.
pub struct NodeService {
    node_id: String,
    registry: Arc<VolumeRegistry>,
    control: Arc<dyn ControlPlane>,
    iscsi: Arc<dyn IscsiClient>,
    probe: ProbeConfig,
}

impl NodeService {
    pub fn new(
        node_id: String,
        registry: Arc<VolumeRegistry>,
        control: Arc<dyn ControlPlane>,
        iscsi: Arc<dyn IscsiClient>,
        probe: ProbeConfig,
    ) -> Self {
        NodeService {
            node_id,
            registry,
            control,
            iscsi,
            probe,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish (mount) the volume at the requested target path.
    pub async fn node_publish_volume(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        match self.publish(req).await {
            Ok(resp) => {
                timer.success();
                Ok(resp)
            }
            Err(status) => {
                timer.failure(&format!("{:?}", status.code()));
                Err(status)
            }
        }
    }

    async fn publish(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status> {
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability missing in request"))?;
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }

        let volume_id = req.volume_id.as_str();
        let mount_options = capability.mount_flags();

        // The iSCSI parameters live on the persistent volume, not in the
        // request.
        let details = self
            .control
            .volume_details(volume_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        let vol = VolumeState::from_details(
            volume_id,
            details,
            &req.target_path,
            req.readonly,
            mount_options,
        );

        // Bounded waits: the orchestrator retries publish on its own
        // cadence, so failing fast here is cheaper than a hung RPC.
        readiness::wait_volume_ready(self.control.as_ref(), volume_id, &self.probe)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        readiness::wait_portal_reachable(&vol.iscsi.target_portal, &self.probe)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let mut re_verified = false;
        loop {
            let mut volumes = self.registry.volumes.write().await;

            let mount_in_progress = match volumes.get(volume_id) {
                // A set device path means a previous publish completed;
                // duplicate requests are answered with success.
                Some(existing) if existing.is_published() => {
                    return Ok(NodePublishVolumeResponse {});
                }
                Some(_) => true,
                None => false,
            };

            if mount_in_progress {
                drop(volumes);
                if re_verified {
                    // Still mounting after a full cycle. Tell the
                    // orchestrator so it keeps retrying instead of
                    // blocking this RPC indefinitely.
                    return Err(Status::internal("Mount under progress"));
                }
                // Another publish holds the mount. Wait one orchestrator
                // cycle and re-examine exactly once.
                tokio::time::sleep(self.probe.republish_delay()).await;
                re_verified = true;
                continue;
            }

            // A record left by a node that crashed while owning the volume
            // must be cleared, otherwise the target keeps rejecting our
            // login.
            match self.control.ownership(volume_id).await {
                Ok(Some(record)) if record.owner_node_id != self.node_id => {
                    info!(
                        volume_id = %volume_id,
                        previous_owner = %record.owner_node_id,
                        "clearing stale ownership record"
                    );
                    self.control
                        .release_ownership(volume_id)
                        .await
                        .map_err(|e| Status::internal(e.to_string()))?;
                }
                Ok(_) => {}
                Err(e) => return Err(Status::internal(e.to_string())),
            }

            // Claiming ownership lets the target gate logins to this node.
            let record = OwnershipRecord::new(volume_id, &self.node_id, &req.target_path);
            self.control
                .claim_ownership(&record)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;

            volumes.insert(volume_id.to_string(), vol.clone());
            metrics::set_volumes_managed(volumes.len());
            drop(volumes);
            break;
        }

        // Strip permissions on the target directory so applications cannot
        // write to the bare local directory if the volume is ever
        // unmounted underneath them. The mounted filesystem's own
        // permissions take over while the mount is in place.
        if let Err(e) = std::fs::create_dir_all(&req.target_path)
            .and_then(|_| mount::chmod_mount_path(&req.target_path))
        {
            return Err(Status::internal(format!(
                "failed to prepare target path {}: {e}",
                req.target_path
            )));
        }

        // Attach failures leave the registry record in place with an empty
        // device path: the orchestrator will retry the publish and observe
        // it, and the supervisor leaves such records alone.
        let device_path = match self.iscsi.attach_and_mount(&vol).await {
            Ok(device_path) => device_path,
            Err(e) => {
                error!(volume_id = %volume_id, error = %e, "attach and mount failed");
                return Err(Status::internal(e.to_string()));
            }
        };

        // Setting the device path marks the publish complete: duplicate
        // requests short-circuit to success and the supervisor may now
        // repair this volume.
        let mut volumes = self.registry.volumes.write().await;
        if let Some(entry) = volumes.get_mut(volume_id) {
            entry.device_path = device_path.clone();
        }
        drop(volumes);

        info!(volume_id = %volume_id, device_path = %device_path, mount_path = %vol.mount_path, "volume published");
        Ok(NodePublishVolumeResponse {})
    }

    /// Unpublish (unmount) the volume from the target path.
    pub async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        match self.unpublish(req).await {
            Ok(resp) => {
                timer.success();
                Ok(resp)
            }
            Err(status) => {
                timer.failure(&format!("{:?}", status.code()));
                Err(status)
            }
        }
    }

    async fn unpublish(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path missing in request"));
        }

        // Removing the record before tearing anything down guarantees the
        // supervisor cannot race a repair against the unmount.
        let vol = {
            let mut volumes = self.registry.volumes.write().await;
            let vol = match volumes.remove(&req.volume_id) {
                Some(vol) => vol,
                None => return Ok(NodeUnpublishVolumeResponse {}),
            };
            metrics::set_volumes_managed(volumes.len());
            vol
        };

        if let Err(e) = self.iscsi.unmount_and_detach(&vol, &req.target_path).await {
            // The record is already gone; the ownership record survives
            // until a later publish clears it.
            warn!(volume_id = %req.volume_id, error = %e, "teardown failed after registry removal");
            return Err(Status::internal(e.to_string()));
        }

        // Safe to drop the ownership record now that the volume has been
        // unmounted and logged out.
        self.control
            .release_ownership(&req.volume_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "volume unpublished");
        Ok(NodeUnpublishVolumeResponse {})
    }

    /// Staging is acknowledged but not performed.
    pub async fn node_stage_volume(
        &self,
        _req: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, Status> {
        Ok(NodeStageVolumeResponse {})
    }

    /// Unstaging is acknowledged but not performed.
    pub async fn node_unstage_volume(
        &self,
        _req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status> {
        Ok(NodeUnstageVolumeResponse {})
    }

    pub async fn node_get_info(
        &self,
        _req: NodeGetInfoRequest,
    ) -> Result<NodeGetInfoResponse, Status> {
        Ok(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 1,
        })
    }

    pub async fn node_get_capabilities(
        &self,
        _req: NodeGetCapabilitiesRequest,
    ) -> Result<NodeGetCapabilitiesResponse, Status> {
        Ok(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                rpc: NodeRpcCapability::Unknown,
            }],
        })
    }

    pub async fn node_expand_volume(&self) -> Result<(), Status> {
        Err(Status::unimplemented(format!(
            "NodeExpandVolume is not supported by {DRIVER_NAME}"
        )))
    }

    pub async fn node_get_volume_stats(&self) -> Result<(), Status> {
        Err(Status::unimplemented(format!(
            "NodeGetVolumeStats is not supported by {DRIVER_NAME}"
        )))
    }
}
