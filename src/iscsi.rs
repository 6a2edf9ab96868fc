//! iSCSI initiator adapter.
//!
//! Wraps open-iscsi's `iscsiadm` for target discovery, login and logout,
//! and locates the block device a login produced. Attach and detach are
//! paired with the mount operations so the callers deal with a single
//! "make this volume usable at this path" primitive.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::mount::{self, MountError};
use crate::volume::VolumeState;

/// Settle time after login before the device node is expected to exist.
const DEVICE_SETTLE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("failed to run iscsiadm: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("iscsiadm {operation} failed: {stderr}")]
    CommandFailed { operation: &'static str, stderr: String },

    #[error("could not find block device for target {iqn}")]
    DeviceNotFound { iqn: String },

    #[error(transparent)]
    Mount(#[from] MountError),
}

/// Attach and detach interface used by the publish handler and the
/// repair worker.
#[tonic::async_trait]
pub trait IscsiClient: Send + Sync {
    /// Log in to the volume's target, locate the block device and mount
    /// it at the volume's mount path. Returns the device path.
    async fn attach_and_mount(&self, vol: &VolumeState) -> Result<String, IscsiError>;

    /// Unmount the target path and log out of the volume's target.
    async fn unmount_and_detach(
        &self,
        vol: &VolumeState,
        target_path: &str,
    ) -> Result<(), IscsiError>;
}

/// `iscsiadm`-backed implementation.
#[derive(Debug, Default, Clone)]
pub struct IscsiAdm;

/// Stable udev name for an iSCSI-attached device.
pub fn by_path_name(target_portal: &str, iqn: &str, lun: i32) -> String {
    format!("ip-{target_portal}-iscsi-{iqn}-lun-{lun}")
}

fn run_iscsiadm(operation: &'static str, args: &[&str]) -> Result<std::process::Output, IscsiError> {
    let output = Command::new("iscsiadm").args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(IscsiError::CommandFailed { operation, stderr });
    }
    Ok(output)
}

impl IscsiAdm {
    fn login(&self, vol: &VolumeState) -> Result<(), IscsiError> {
        let portal = vol.iscsi.target_portal.as_str();
        let iqn = vol.iscsi.iqn.as_str();

        // Discovery failure is not fatal, the node entry may already exist.
        if let Err(e) = run_iscsiadm(
            "discovery",
            &[
                "-m",
                "discoverydb",
                "-t",
                "sendtargets",
                "-p",
                portal,
                "-I",
                &vol.iscsi.iscsi_interface,
                "--discover",
            ],
        ) {
            warn!(target_portal = %portal, error = %e, "sendtargets discovery failed, continuing");
        }

        match run_iscsiadm("login", &["-m", "node", "-T", iqn, "-p", portal, "--login"]) {
            Ok(_) => Ok(()),
            Err(IscsiError::CommandFailed { stderr, .. })
                if stderr.contains("already present") || stderr.contains("session already exists") =>
            {
                info!(iqn = %iqn, "iSCSI session already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn logout(&self, vol: &VolumeState) -> Result<(), IscsiError> {
        let iqn = vol.iscsi.iqn.as_str();
        match run_iscsiadm(
            "logout",
            &[
                "-m",
                "node",
                "-T",
                iqn,
                "-p",
                vol.iscsi.target_portal.as_str(),
                "--logout",
            ],
        ) {
            Ok(_) => Ok(()),
            Err(IscsiError::CommandFailed { stderr, .. })
                if stderr.contains("No matching sessions") || stderr.contains("not logged in") =>
            {
                warn!(iqn = %iqn, "target was not logged in");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Locate the block device produced by the login.
    ///
    /// The udev by-path link is stable and preferred; the session listing
    /// is the fallback when udev has not populated it.
    fn find_device(&self, vol: &VolumeState) -> Result<String, IscsiError> {
        let link = Path::new("/dev/disk/by-path").join(by_path_name(
            &vol.iscsi.target_portal,
            &vol.iscsi.iqn,
            vol.iscsi.lun,
        ));
        if link.exists() {
            if let Ok(device) = fs::canonicalize(&link) {
                return Ok(device.to_string_lossy().to_string());
            }
        }

        let output = run_iscsiadm("session", &["-m", "session", "-P", "3"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(device) = parse_session_device(&stdout, &vol.iscsi.iqn) {
            return Ok(device);
        }

        Err(IscsiError::DeviceNotFound {
            iqn: vol.iscsi.iqn.clone(),
        })
    }
}

/// Pull the attached disk name out of `iscsiadm -m session -P 3` output
/// for the given target.
pub(crate) fn parse_session_device(stdout: &str, iqn: &str) -> Option<String> {
    let mut in_target = false;
    for line in stdout.lines() {
        if line.contains("Target:") {
            in_target = line.contains(iqn);
        }
        if in_target && line.contains("Attached scsi disk") {
            let device = line.split_whitespace().nth(3)?;
            if device.starts_with("sd") {
                return Some(format!("/dev/{device}"));
            }
        }
    }
    None
}

#[tonic::async_trait]
impl IscsiClient for IscsiAdm {
    async fn attach_and_mount(&self, vol: &VolumeState) -> Result<String, IscsiError> {
        info!(
            volume_id = %vol.volume_id,
            iqn = %vol.iscsi.iqn,
            target_portal = %vol.iscsi.target_portal,
            "attaching volume"
        );

        self.login(vol)?;
        tokio::time::sleep(DEVICE_SETTLE).await;
        let device = self.find_device(vol)?;

        let mut options = vol.mount_options.clone();
        if vol.read_only && !options.iter().any(|o| o == "ro") {
            options.push("ro".to_string());
        }
        if let Err(e) = mount::mount_device(&device, &vol.mount_path, &vol.fs_type, &options) {
            error!(volume_id = %vol.volume_id, device = %device, error = %e, "mount failed");
            return Err(e.into());
        }

        info!(volume_id = %vol.volume_id, device = %device, mount_path = %vol.mount_path, "volume attached and mounted");
        Ok(device)
    }

    async fn unmount_and_detach(
        &self,
        vol: &VolumeState,
        target_path: &str,
    ) -> Result<(), IscsiError> {
        info!(volume_id = %vol.volume_id, target_path = %target_path, "detaching volume");
        mount::unmount(target_path)?;
        self.logout(vol)?;
        Ok(())
    }
}

/// Recording fake used by the unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeIscsiClient {
        pub(crate) attaches: AtomicUsize,
        pub(crate) detaches: AtomicUsize,
        pub(crate) fail_attach: AtomicBool,
    }

    impl FakeIscsiClient {
        pub(crate) fn attach_count(&self) -> usize {
            self.attaches.load(Ordering::SeqCst)
        }

        pub(crate) fn detach_count(&self) -> usize {
            self.detaches.load(Ordering::SeqCst)
        }

        pub(crate) fn fail_next_attach(&self) {
            self.fail_attach.store(true, Ordering::SeqCst);
        }
    }

    #[tonic::async_trait]
    impl IscsiClient for FakeIscsiClient {
        async fn attach_and_mount(&self, vol: &VolumeState) -> Result<String, IscsiError> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            if self.fail_attach.swap(false, Ordering::SeqCst) {
                return Err(IscsiError::DeviceNotFound {
                    iqn: vol.iscsi.iqn.clone(),
                });
            }
            Ok(format!("/dev/fake-{}", vol.volume_id))
        }

        async fn unmount_and_detach(
            &self,
            _vol: &VolumeState,
            _target_path: &str,
        ) -> Result<(), IscsiError> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
