//! CSI node service wire types.
//!
//! Request and response messages for the node verbs, serialized as JSON
//! with the camelCase field names used by the CSI spec. The transport
//! envelope that carries them lives in `server`.

use serde::{Deserialize, Serialize};

/// Volume access mode, advisory info from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessMode {
    #[serde(rename = "SINGLE_NODE_WRITER")]
    #[default]
    SingleNodeWriter,
    #[serde(rename = "SINGLE_NODE_READER_ONLY")]
    SingleNodeReaderOnly,
    #[serde(rename = "MULTI_NODE_READER_ONLY")]
    MultiNodeReaderOnly,
}

/// Mount-specific part of a volume capability.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountVolumeCapability {
    #[serde(rename = "fsType", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(rename = "mountFlags", default, skip_serializing_if = "Vec::is_empty")]
    pub mount_flags: Vec<String>,
}

/// How the orchestrator intends to consume the volume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeCapability {
    #[serde(rename = "accessMode", skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    #[serde(rename = "mount", skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountVolumeCapability>,
}

impl VolumeCapability {
    /// Mount flags requested by the orchestrator, empty when none were set.
    pub fn mount_flags(&self) -> Vec<String> {
        self.mount
            .as_ref()
            .map(|m| m.mount_flags.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodePublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(rename = "volumeCapability", skip_serializing_if = "Option::is_none")]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodePublishVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnpublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnpublishVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeStageVolumeRequest {
    #[serde(rename = "volumeId", default)]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath", default)]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeStageVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnstageVolumeRequest {
    #[serde(rename = "volumeId", default)]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath", default)]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnstageVolumeResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGetInfoRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "maxVolumesPerNode")]
    pub max_volumes_per_node: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGetCapabilitiesRequest {}

/// RPC capability advertised by the node service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRpcCapability {
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeServiceCapability {
    pub rpc: NodeRpcCapability,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGetCapabilitiesResponse {
    #[serde(default)]
    pub capabilities: Vec<NodeServiceCapability>,
}
