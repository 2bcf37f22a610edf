//! JivaVolume CRD
//!
//! The declarative record of one replicated block volume: what the
//! orchestrator asked for (spec) and where the volume is in its lifecycle
//! (status). The controller service is the only writer.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// =============================================================================
// JivaVolume CRD
// =============================================================================

/// JivaVolume describes a volume served by one Jiva controller process and
/// `replicaCount` synchronously replicated replica processes.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "csi.jiva.io",
    version = "v1",
    kind = "JivaVolume",
    plural = "jivavolumes",
    shortname = "jv",
    status = "JivaVolumeStatus",
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.capacityBytes"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicaCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumeSpec {
    /// Capacity requested at creation time, in bytes
    pub capacity_bytes: u64,

    /// Desired number of replica processes
    pub replica_count: u32,

    /// Access mode the volume was created for
    pub access_mode: AccessMode,

    /// Filesystem or raw block access
    pub access_type: AccessType,

    /// Storage class parameters passed through to the backend
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// How many nodes may use the volume and with which rights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Whether at most one node may have the volume published
    pub fn is_single_node(&self) -> bool {
        match self {
            AccessMode::SingleNodeWriter
            | AccessMode::SingleNodeReaderOnly
            | AccessMode::SingleNodeSingleWriter
            | AccessMode::SingleNodeMultiWriter => true,
            AccessMode::MultiNodeReaderOnly
            | AccessMode::MultiNodeSingleWriter
            | AccessMode::MultiNodeMultiWriter => false,
        }
    }

    /// Whether every publication of the volume is read-only
    pub fn is_read_only(&self) -> bool {
        match self {
            AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly => true,
            AccessMode::SingleNodeWriter
            | AccessMode::SingleNodeSingleWriter
            | AccessMode::SingleNodeMultiWriter
            | AccessMode::MultiNodeSingleWriter
            | AccessMode::MultiNodeMultiWriter => false,
        }
    }

    /// An iSCSI LUN can only be written from one host at a time
    pub fn is_supported(&self) -> bool {
        !matches!(self, AccessMode::MultiNodeMultiWriter)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessMode::SingleNodeWriter => "SINGLE_NODE_WRITER",
            AccessMode::SingleNodeReaderOnly => "SINGLE_NODE_READER_ONLY",
            AccessMode::SingleNodeSingleWriter => "SINGLE_NODE_SINGLE_WRITER",
            AccessMode::SingleNodeMultiWriter => "SINGLE_NODE_MULTI_WRITER",
            AccessMode::MultiNodeReaderOnly => "MULTI_NODE_READER_ONLY",
            AccessMode::MultiNodeSingleWriter => "MULTI_NODE_SINGLE_WRITER",
            AccessMode::MultiNodeMultiWriter => "MULTI_NODE_MULTI_WRITER",
        };
        f.write_str(s)
    }
}

/// Filesystems the node service knows how to create and grow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[default]
    Ext4,
    Xfs,
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsType::Ext4 => write!(f, "ext4"),
            FsType::Xfs => write!(f, "xfs"),
        }
    }
}

impl FromStr for FsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            other => Err(Error::InvalidArgument(format!(
                "unsupported filesystem type: {}",
                other
            ))),
        }
    }
}

/// Filesystem mount or raw block device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AccessType {
    #[serde(rename_all = "camelCase")]
    Mount {
        #[serde(default)]
        fs_type: FsType,
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    Block,
}

impl AccessType {
    pub fn is_block(&self) -> bool {
        matches!(self, AccessType::Block)
    }

    /// Same kind of access, ignoring per-mount flags
    pub fn is_compatible(&self, other: &AccessType) -> bool {
        match (self, other) {
            (AccessType::Block, AccessType::Block) => true,
            (AccessType::Mount { fs_type: a, .. }, AccessType::Mount { fs_type: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Default for AccessType {
    fn default() -> Self {
        AccessType::Mount {
            fs_type: FsType::default(),
            mount_flags: Vec::new(),
        }
    }
}

/// Where the volume's controller process can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendEndpoint {
    /// Base URL of the controller's management API
    pub controller_api: String,
    /// iSCSI portal (`host:port`)
    pub target_portal: String,
    /// iSCSI qualified name of the target
    pub iqn: String,
    /// Logical unit number
    #[serde(default)]
    pub lun: u32,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the JivaVolume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumeStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: VolumePhase,

    /// Capacity confirmed by a replica quorum, in bytes
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Controller endpoint, once the backend has assigned one
    #[serde(default)]
    pub endpoint: Option<BackendEndpoint>,

    /// Nodes the volume is published to
    #[serde(default)]
    pub published_nodes: Vec<String>,

    /// Phase to return to once a resize completes
    #[serde(default)]
    pub resize_from: Option<VolumePhase>,

    /// Size the backend was last asked to grow to, while `Resizing`
    #[serde(default)]
    pub resize_to: Option<u64>,

    /// Human-readable detail about the last transition
    #[serde(default)]
    pub message: Option<String>,

    /// Last phase change
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Volume lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum VolumePhase {
    #[default]
    Creating,
    Ready,
    Published,
    Resizing,
    Deleting,
    Error,
}

impl VolumePhase {
    /// Allowed edges of the lifecycle state machine. Staying in the same
    /// phase is always allowed so retries can rewrite a status.
    pub fn can_transition_to(self, next: VolumePhase) -> bool {
        use VolumePhase::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (Creating, Ready) | (Creating, Error) => true,
            (Error, Creating) => true,
            (Ready, Published) | (Ready, Resizing) => true,
            (Published, Ready) | (Published, Resizing) => true,
            (Resizing, Ready) | (Resizing, Published) => true,
            (Deleting, _) => false,
            (_, Deleting) => true,
            _ => false,
        }
    }

    /// Phases in which the backend has reported quorum
    pub fn is_usable(self) -> bool {
        matches!(self, VolumePhase::Ready | VolumePhase::Published)
    }
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Creating => write!(f, "Creating"),
            VolumePhase::Ready => write!(f, "Ready"),
            VolumePhase::Published => write!(f, "Published"),
            VolumePhase::Resizing => write!(f, "Resizing"),
            VolumePhase::Deleting => write!(f, "Deleting"),
            VolumePhase::Error => write!(f, "Error"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl JivaVolume {
    /// Build a fresh resource in the `Creating` phase
    pub fn creating(name: &str, namespace: &str, spec: JivaVolumeSpec) -> Self {
        let mut volume = JivaVolume::new(name, spec);
        volume.metadata.namespace = Some(namespace.to_string());
        volume.status = Some(JivaVolumeStatus {
            phase: VolumePhase::Creating,
            last_transition_time: Some(Utc::now()),
            ..Default::default()
        });
        volume
    }

    /// Get the name of this volume
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Current phase; a resource without status is still being created
    pub fn phase(&self) -> VolumePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Capacity confirmed by the backend
    pub fn current_capacity(&self) -> u64 {
        self.status.as_ref().map(|s| s.capacity_bytes).unwrap_or(0)
    }

    pub fn endpoint(&self) -> Option<&BackendEndpoint> {
        self.status.as_ref().and_then(|s| s.endpoint.as_ref())
    }

    pub fn published_nodes(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.published_nodes.as_slice())
            .unwrap_or(&[])
    }

    pub fn status_mut(&mut self) -> &mut JivaVolumeStatus {
        self.status.get_or_insert_with(JivaVolumeStatus::default)
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow
    pub fn transition(&mut self, next: VolumePhase, message: Option<String>) -> Result<()> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            return Err(Error::FailedPrecondition(format!(
                "volume {} cannot move from {} to {}",
                self.name(),
                current,
                next
            )));
        }
        let status = self.status_mut();
        if status.phase != next {
            status.last_transition_time = Some(Utc::now());
        }
        status.phase = next;
        status.message = message;
        Ok(())
    }

    /// Describe why `spec` does not describe this volume, if it does not
    pub fn mismatch(&self, spec: &JivaVolumeSpec) -> Option<String> {
        if self.spec.capacity_bytes != spec.capacity_bytes {
            return Some(format!(
                "capacity {} != requested {}",
                self.spec.capacity_bytes, spec.capacity_bytes
            ));
        }
        if self.spec.replica_count != spec.replica_count {
            return Some(format!(
                "replica count {} != requested {}",
                self.spec.replica_count, spec.replica_count
            ));
        }
        if self.spec.access_mode != spec.access_mode {
            return Some(format!(
                "access mode {} != requested {}",
                self.spec.access_mode, spec.access_mode
            ));
        }
        if !self.spec.access_type.is_compatible(&spec.access_type) {
            return Some("access type differs".to_string());
        }
        None
    }
}
