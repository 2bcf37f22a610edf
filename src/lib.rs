//! Jiva CSI driver
//!
//! Container-storage driver for network-replicated Jiva block volumes. The
//! controller provisions volumes through the Jiva management API and waits
//! for their replicas to form a quorum; the node plugin attaches them over
//! iSCSI, formats and mounts them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   RPC surface  /csi.v1.<Service>/<Method>                │
//! ├──────────────────┬───────────────────────────┬──────────────────────────┤
//! │    Identity      │        Controller         │          Node            │
//! │                  │  ┌────────────────────┐   │  ┌────────────────────┐  │
//! │                  │  │  Quorum Reconciler │   │  │  Publish Records   │  │
//! │                  │  └─────────┬──────────┘   │  └────────────────────┘  │
//! ├──────────────────┴────────────┼──────────────┴──────────────────────────┤
//! │              Per-Volume Lock Registry (fail-fast, RAII)                  │
//! ├───────────────────────┬───────┴───────────────┬─────────────────────────┤
//! │   Volume Store        │   Backend Control     │   Host Ops              │
//! │   (JivaVolume CRD)    │   (Jiva HTTP API)     │   (iscsiadm, mount)     │
//! └───────────────────────┴───────────────────────┴─────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`csi`]: Identity, Controller and Node services
//! - [`api`]: HTTP/JSON transport for the services
//! - [`reconciler`]: replica quorum polling
//! - [`store`]: JivaVolume persistence
//! - [`backend`]: Jiva management and controller API client
//! - [`host`]: iSCSI sessions, filesystems and mounts
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: port traits the services are written against
//! - [`error`]: Error types and handling

pub mod api;
pub mod backend;
pub mod config;
pub mod crd;
pub mod csi;
pub mod domain;
pub mod error;
pub mod host;
pub mod lock;
pub mod metrics;
pub mod reconciler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use api::{RpcServer, Services};
pub use backend::{JivaBackend, JivaBackendConfig};
pub use config::{DriverConfig, DEFAULT_DRIVER_NAME};
pub use crd::{
    AccessMode, AccessType, BackendEndpoint, FsType, JivaVolume, JivaVolumeSpec,
    JivaVolumeStatus, VolumePhase,
};
pub use csi::node::{PublishRecord, PublishRecords};
pub use csi::{CallContext, ControllerService, IdentityService, NodeService};
pub use domain::ports::{
    BackendControl, BackendControlRef, HostOps, HostOpsRef, VolumeStore, VolumeStoreRef,
};
pub use error::{Code, Error, Result};
pub use host::{HostConfig, LinuxHost};
pub use lock::VolumeLocks;
pub use metrics::Metrics;
pub use reconciler::{QuorumPolicy, QuorumReconciler, ReconcilerConfig};
pub use store::{KubeVolumeStore, MemoryVolumeStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
