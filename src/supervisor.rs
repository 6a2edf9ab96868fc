//! Mount supervisor.
//!
//! A single long-running task that keeps the kernel mount state in line
//! with what the registry says it should be. Every sweep compares the
//! mount table against the registry snapshot and spawns one repair task
//! per drifted volume, so a slow or wedged volume never stalls the sweep
//! or the other repairs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::control::ControlPlane;
use crate::iscsi::IscsiClient;
use crate::metrics;
use crate::mount::{self, MountPoint};
use crate::readiness::{self, ProbeConfig};
use crate::registry::VolumeRegistry;
use crate::volume::VolumeState;

/// Time between supervisor sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// What a repair worker has to do for one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairPlan {
    /// The path is mounted but without the `rw` option: unmount it and
    /// mount the same device back with `rw`. A plain remount was tried
    /// and did not reliably replace the offending flags.
    Remount(MountPoint),
    /// The path is not mounted at all: run the full login and mount.
    Reattach,
}

/// Decide whether a volume needs repair, and which kind.
///
/// Volumes whose first publish has not completed are left strictly alone;
/// only the publish handler may touch them.
pub fn plan_repair(vol: &VolumeState, mounts: &[MountPoint]) -> Option<RepairPlan> {
    if !vol.is_published() {
        return None;
    }
    match mount::find_mount(mounts, &vol.mount_path) {
        Some(entry) if mount::verify_mount_opts(&entry.options, "rw") => None,
        Some(entry) => Some(RepairPlan::Remount(entry.clone())),
        None => Some(RepairPlan::Reattach),
    }
}

/// Periodic reconciler between the kernel mount table and the registry.
pub struct MountSupervisor {
    registry: Arc<VolumeRegistry>,
    control: Arc<dyn ControlPlane>,
    iscsi: Arc<dyn IscsiClient>,
    probe: ProbeConfig,
}

impl MountSupervisor {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        control: Arc<dyn ControlPlane>,
        iscsi: Arc<dyn IscsiClient>,
        probe: ProbeConfig,
    ) -> Self {
        MountSupervisor {
            registry,
            control,
            iscsi,
            probe,
        }
    }

    /// Run forever, sweeping on a fixed interval. Errors reading the
    /// mount table are logged and the next sweep retries.
    pub async fn run(self) {
        info!(interval = ?SWEEP_INTERVAL, "mount supervisor started");
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match mount::list_mounts() {
                Ok(mounts) => {
                    self.sweep(&mounts).await;
                }
                Err(e) => error!(error = %e, "failed to read mount table"),
            }
        }
    }

    /// One reconciliation pass. Returns how many repair tasks were
    /// spawned, mainly so tests can observe the decisions.
    pub async fn sweep(&self, mounts: &[MountPoint]) -> usize {
        let mut spawned = 0;
        for vol in self.registry.snapshot().await {
            let plan = match plan_repair(&vol, mounts) {
                Some(plan) => plan,
                None => continue,
            };

            // A repair already in flight keeps the volume claimed until
            // it finishes, successfully or not.
            if !self.registry.mark_repairing(&vol.volume_id).await {
                continue;
            }

            warn!(
                volume_id = %vol.volume_id,
                mount_path = %vol.mount_path,
                plan = ?plan,
                "mount state drifted, scheduling repair"
            );

            let registry = self.registry.clone();
            let control = self.control.clone();
            let iscsi = self.iscsi.clone();
            let probe = self.probe;
            tokio::spawn(async move {
                repair_volume(registry, control, iscsi, probe, vol, plan).await;
            });
            spawned += 1;
        }
        spawned
    }
}

/// Re-establish the desired mount state for one volume.
///
/// Blocks without bound until the volume is ready and its portal is
/// reachable; there is no point issuing logins before that. The repair
/// marker is cleared on every exit path so the next sweep can reconsider
/// the volume after a failure.
pub async fn repair_volume(
    registry: Arc<VolumeRegistry>,
    control: Arc<dyn ControlPlane>,
    iscsi: Arc<dyn IscsiClient>,
    probe: ProbeConfig,
    vol: VolumeState,
    plan: RepairPlan,
) {
    readiness::wait_ready_and_reachable(control.as_ref(), &vol, &probe).await;

    let outcome = match &plan {
        RepairPlan::Remount(entry) => {
            info!(volume_id = %vol.volume_id, mount_path = %entry.path, "remounting read-write");
            mount::unmount(&entry.path)
                .and_then(|_| {
                    mount::mount_device(&entry.device, &entry.path, "", &["rw".to_string()])
                })
                .map_err(|e| e.to_string())
        }
        RepairPlan::Reattach => iscsi
            .attach_and_mount(&vol)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string()),
    };

    match outcome {
        Ok(()) => {
            metrics::record_remount("success");
            info!(volume_id = %vol.volume_id, "repair complete");
        }
        Err(e) => {
            // The registry entry stays; the next sweep will try again.
            metrics::record_remount("failure");
            error!(volume_id = %vol.volume_id, error = %e, "repair failed");
        }
    }

    registry.clear_repairing(&vol.volume_id).await;
}
