//! Domain Ports - Core trait definitions for the CSI driver
//!
//! These traits are the seams between the volume lifecycle logic and the
//! systems it drives: the resource store, the storage backend and the host.
//! Every service receives its collaborators through these traits, so tests
//! swap in in-memory or fake implementations.

use crate::crd::{AccessType, BackendEndpoint, FsType, JivaVolume};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Volume Store Port
// =============================================================================

/// One page of a volume listing
#[derive(Debug, Clone, Default)]
pub struct VolumePage {
    pub volumes: Vec<JivaVolume>,
    /// Token for the next page; `None` on the last page
    pub continue_token: Option<String>,
}

/// Change notification for a watched volume
#[derive(Debug, Clone)]
pub enum VolumeEvent {
    /// The volume was created or its status changed
    Applied(JivaVolume),
    /// The volume is gone
    Deleted(String),
}

/// Declarative store of [`JivaVolume`] resources
///
/// Status writes are compare-and-set: the caller passes back the object it
/// read, and a concurrent writer in between makes the write fail with
/// [`crate::Error::VersionConflict`].
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Fetch a volume by name
    async fn get(&self, name: &str) -> Result<Option<JivaVolume>>;

    /// Create a volume; fails with `AlreadyExists` if the name is taken
    async fn create(&self, volume: &JivaVolume) -> Result<JivaVolume>;

    /// Write the status of `volume` if nobody changed it since it was read
    async fn update_status(&self, volume: &JivaVolume) -> Result<JivaVolume>;

    /// Delete a volume; returns `false` if it did not exist
    async fn delete(&self, name: &str) -> Result<bool>;

    /// List one page of volumes
    async fn list(&self, limit: u32, continue_token: Option<String>) -> Result<VolumePage>;

    /// Stream changes to a single volume
    async fn watch(&self, name: &str) -> Result<BoxStream<'static, Result<VolumeEvent>>>;
}

// =============================================================================
// Backend Port
// =============================================================================

/// Health of one replica process as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaHealth {
    /// In sync with the controller and serving writes
    Healthy,
    /// Reachable but rebuilding or write-only
    Degraded,
    /// Not answering the controller
    Unreachable,
}

/// One replica in a status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub address: String,
    pub health: ReplicaHealth,
    /// Size of the replica's backing store, in bytes
    pub size_bytes: u64,
}

/// Point-in-time view of a volume's replicas, read from the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatusSnapshot {
    pub replicas: Vec<ReplicaStatus>,
    /// Whether the controller itself considers the volume writable
    pub controller_quorum: bool,
    /// Size the controller exposes to initiators, in bytes
    pub controller_size_bytes: u64,
}

impl ReplicaStatusSnapshot {
    pub fn healthy_count(&self) -> u32 {
        self.replicas
            .iter()
            .filter(|r| r.health == ReplicaHealth::Healthy)
            .count() as u32
    }

    /// Healthy replicas that already report at least `min_bytes`
    pub fn healthy_at_size(&self, min_bytes: u64) -> u32 {
        self.replicas
            .iter()
            .filter(|r| r.health == ReplicaHealth::Healthy && r.size_bytes >= min_bytes)
            .count() as u32
    }
}

/// What the backend needs to instantiate a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub name: String,
    pub capacity_bytes: u64,
    pub replica_count: u32,
    pub parameters: BTreeMap<String, String>,
}

/// Control API of the replicated block storage engine
#[async_trait]
pub trait BackendControl: Send + Sync {
    /// Start (or find) the controller and replica processes for a volume.
    /// Calling it again for the same volume returns the same endpoint.
    async fn provision(&self, request: &ProvisionRequest) -> Result<BackendEndpoint>;

    /// Stop the volume's processes and release its storage. Succeeds if
    /// the volume is already gone.
    async fn teardown(&self, name: &str) -> Result<()>;

    /// Read the replica status from the volume's controller process
    async fn replica_status(&self, endpoint: &BackendEndpoint) -> Result<ReplicaStatusSnapshot>;

    /// Ask the controller process to grow the replicated store
    async fn resize(&self, endpoint: &BackendEndpoint, name: &str, size_bytes: u64) -> Result<()>;

    /// Check the management API is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Backend name, for logs
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Host Port (Device & Mount Manager)
// =============================================================================

/// iSCSI target to log in to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiTarget {
    pub portal: String,
    pub iqn: String,
    pub lun: u32,
}

impl From<&BackendEndpoint> for IscsiTarget {
    fn from(endpoint: &BackendEndpoint) -> Self {
        Self {
            portal: endpoint.target_portal.clone(),
            iqn: endpoint.iqn.clone(),
            lun: endpoint.lun,
        }
    }
}

impl std::fmt::Display for IscsiTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/lun{}", self.iqn, self.portal, self.lun)
    }
}

/// Host-level block device and mount operations
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Open an iSCSI session and return the block device it exposes
    async fn login(&self, target: &IscsiTarget) -> Result<PathBuf>;

    /// Close the iSCSI session; succeeds if none is open
    async fn logout(&self, target: &IscsiTarget) -> Result<()>;

    /// Make the kernel re-read the LUN size
    async fn rescan(&self, target: &IscsiTarget) -> Result<()>;

    /// Filesystem on the device, `None` if it is blank
    async fn probe_fs(&self, device: &Path) -> Result<Option<String>>;

    async fn format(&self, device: &Path, fs_type: FsType) -> Result<()>;

    /// Size of the block device in bytes
    async fn device_size(&self, device: &Path) -> Result<u64>;

    /// Grow a mounted filesystem to fill its device
    async fn grow_fs(&self, device: &Path, mount_path: &Path, fs_type: FsType) -> Result<()>;

    async fn mount(&self, device: &Path, target: &Path, fs_type: FsType, flags: &[String])
        -> Result<()>;

    /// Bind `source` onto `target`, read-only if asked
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;

    /// Unmount `target`; succeeds if it is not mounted
    async fn unmount(&self, target: &Path) -> Result<()>;

    async fn is_mounted(&self, target: &Path) -> Result<bool>;
}

/// Prepare a staging or target path before mounting onto it
pub async fn ensure_mount_point(path: &Path, access_type: &AccessType) -> Result<()> {
    match access_type {
        AccessType::Mount { .. } => tokio::fs::create_dir_all(path).await?,
        AccessType::Block => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if tokio::fs::metadata(path).await.is_err() {
                tokio::fs::File::create(path).await?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeStoreRef = Arc<dyn VolumeStore>;
pub type BackendControlRef = Arc<dyn BackendControl>;
pub type HostOpsRef = Arc<dyn HostOps>;
