//! Per-volume state tracked by the node plugin.

use serde::{Deserialize, Serialize};

use crate::control::VolumeDetails;

/// iSCSI addressing for a volume's target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IscsiSpec {
    /// Network endpoint of the target, `host:port`.
    #[serde(rename = "targetPortal")]
    pub target_portal: String,
    pub iqn: String,
    pub lun: i32,
    #[serde(rename = "iscsiInterface")]
    pub iscsi_interface: String,
}

/// The record the registry keeps for every volume published on this node.
///
/// `device_path` stays empty until the first attach and mount completes;
/// once set it never goes back to empty while the record exists. The mount
/// supervisor only touches volumes whose `device_path` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VolumeState {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    pub name: String,
    #[serde(rename = "fsType")]
    pub fs_type: String,
    pub capacity: String,
    #[serde(rename = "accessModes", default)]
    pub access_modes: Vec<String>,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
    #[serde(rename = "mountOptions", default)]
    pub mount_options: Vec<String>,
    /// Absolute directory the filesystem must be bound at.
    #[serde(rename = "mountPath")]
    pub mount_path: String,
    pub iscsi: IscsiSpec,
    /// Block device backing the mount, empty until the first mount is done.
    #[serde(rename = "devicePath", default)]
    pub device_path: String,
}

impl VolumeState {
    /// Build the in-memory record from the persistent-volume details and
    /// the publish-time arguments.
    pub fn from_details(
        volume_id: &str,
        details: VolumeDetails,
        mount_path: &str,
        read_only: bool,
        mount_options: Vec<String>,
    ) -> Self {
        VolumeState {
            volume_id: volume_id.to_string(),
            name: details.name,
            fs_type: details.fs_type,
            capacity: details.capacity,
            access_modes: details.access_modes,
            read_only,
            mount_options,
            mount_path: mount_path.to_string(),
            iscsi: IscsiSpec {
                target_portal: details.target_portal,
                iqn: details.iqn,
                lun: details.lun,
                iscsi_interface: details.iscsi_interface,
            },
            device_path: String::new(),
        }
    }

    /// Whether the first publish has completed on this node.
    pub fn is_published(&self) -> bool {
        !self.device_path.is_empty()
    }
}
