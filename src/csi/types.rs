//! Request and response messages of the Identity, Controller and Node
//! services.
//!
//! All messages are JSON with camelCase field names. Optional collections
//! default to empty so callers may omit them.

use crate::crd::{AccessMode, AccessType};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Capacity used when a create request carries no range
pub const DEFAULT_CAPACITY_BYTES: u64 = 1 << 30;

// -----------------------------------------------------------------------------
// Shared
// -----------------------------------------------------------------------------

/// Empty response body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Requested size bounds; zero means unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: u64,
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    pub fn required(required_bytes: u64) -> Self {
        Self {
            required_bytes,
            limit_bytes: 0,
        }
    }

    /// Size to provision: the required size, else the limit, else `default`
    pub fn resolve(&self, default: u64) -> Result<u64> {
        if self.limit_bytes > 0 && self.required_bytes > self.limit_bytes {
            return Err(Error::InvalidArgument(format!(
                "required bytes {} exceed limit bytes {}",
                self.required_bytes, self.limit_bytes
            )));
        }
        Ok(match (self.required_bytes, self.limit_bytes) {
            (0, 0) => default,
            (0, limit) => default.min(limit),
            (required, _) => required,
        })
    }
}

/// What the workload needs from the volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default)]
    pub access_type: AccessType,
}

/// A volume as reported to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub volume_id: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// Identity
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPluginInfoResponse {
    pub name: String,
    pub vendor_version: String,
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    ControllerService,
    OnlineVolumeExpansion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<PluginCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}

// -----------------------------------------------------------------------------
// Controller
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Overrides the `replicaCount` parameter and the configured default
    #[serde(default)]
    pub replica_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: VolumeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeResponse {
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesRequest {
    /// Page size; 0 lets the driver choose
    #[serde(default)]
    pub max_entries: u32,
    #[serde(default)]
    pub starting_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesEntry {
    pub volume: VolumeInfo,
    pub published_node_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesResponse {
    pub entries: Vec<ListVolumesEntry>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVolumeCapabilitiesResponse {
    /// Set only when every requested capability is supported
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ExpandVolume,
    ListVolumes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<ControllerCapability>,
}

// -----------------------------------------------------------------------------
// Node
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: PathBuf,
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: PathBuf,
    pub target_path: PathBuf,
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: PathBuf,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    /// 0 means no limit
    pub max_volumes_per_node: i64,
}
