//! OpenEBS-style CSI node plugin for iSCSI-backed block volumes.
//!
//! The plugin mounts volumes on behalf of the orchestrator and keeps them
//! mounted: a registry tracks every volume published on this node, and a
//! background supervisor compares the kernel mount table against the
//! registry, repairing volumes that drifted (unmounted or remounted
//! read-only by the kernel after an I/O error).
//!
//! This library provides:
//! - The CSI node service implementation (publish, unpublish, node info)
//! - The volume registry and the mount supervisor
//! - Readiness probing for the volume target before any iSCSI login
//! - Adapters for the control plane, `iscsiadm` and the kernel mount table

pub mod config;
pub mod control;
pub mod csi;
pub mod iscsi;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod readiness;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod volume;

pub use control::{ControlPlane, MapiClient, OwnershipRecord, VolumeDetails, VolumeStatus};
pub use iscsi::{IscsiAdm, IscsiClient};
pub use node::NodeService;
pub use readiness::ProbeConfig;
pub use registry::VolumeRegistry;
pub use supervisor::MountSupervisor;
pub use volume::VolumeState;

pub const DRIVER_NAME: &str = "iscsi.csi.openebs.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
