//! Custom Resource Definitions for the Jiva CSI driver
//!
//! - JivaVolume: desired and observed state of one replicated block volume

pub mod jiva_volume;

pub use jiva_volume::*;

use kube::CustomResourceExt;

/// Render the CRD manifest as YAML, for `--print-crd`
pub fn crd_manifest() -> crate::error::Result<String> {
    serde_yaml::to_string(&JivaVolume::crd())
        .map_err(|e| crate::error::Error::Internal(format!("CRD serialization failed: {}", e)))
}
