//! Driver configuration
//!
//! One [`DriverConfig`] tree, loaded from an optional YAML file and then
//! overridden by command line flags. Services receive the parts they need
//! as plain values.

use crate::backend::JivaBackendConfig;
use crate::error::{Error, Result};
use crate::reconciler::ReconcilerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default protocol name of the driver
pub const DEFAULT_DRIVER_NAME: &str = "jiva.csi.openebs.io";

/// Complete driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    /// Name reported by GetPluginInfo
    pub driver_name: String,
    /// Namespace holding the JivaVolume resources
    pub namespace: String,
    /// Replica count when neither the request nor its parameters set one
    pub default_replica_count: u32,
    pub controller: ControllerConfig,
    pub node: NodeConfig,
    pub reconciler: ReconcilerConfig,
    pub backend: JivaBackendConfig,
    pub server: ServerConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            namespace: "openebs".to_string(),
            default_replica_count: 3,
            controller: ControllerConfig::default(),
            node: NodeConfig::default(),
            reconciler: ReconcilerConfig::default(),
            backend: JivaBackendConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Load a configuration file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: DriverConfig = serde_yaml::from_str(&raw).map_err(|e| {
            Error::Configuration(format!("invalid config file {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver_name.trim().is_empty() {
            return Err(Error::Configuration("driver name must not be empty".into()));
        }
        if self.namespace.trim().is_empty() {
            return Err(Error::Configuration("namespace must not be empty".into()));
        }
        if self.default_replica_count == 0 {
            return Err(Error::Configuration(
                "default replica count must be at least 1".into(),
            ));
        }
        if self.reconciler.poll_interval_ms == 0 {
            return Err(Error::Configuration("poll interval must be positive".into()));
        }
        if self.reconciler.max_fetch_failures == 0 {
            return Err(Error::Configuration(
                "max fetch failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Controller service timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Upper bound on waiting for quorum after a provision
    pub create_timeout_secs: u64,
    /// Upper bound on waiting for quorum at the new size after a resize
    pub expand_timeout_secs: u64,
    /// Upper bound on waiting for the resource to disappear after a delete
    pub delete_timeout_secs: u64,
    /// Largest page ListVolumes returns when the caller sets no limit
    pub list_page_size: u32,
}

impl ControllerConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn expand_timeout(&self) -> Duration {
        Duration::from_secs(self.expand_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            create_timeout_secs: 120,
            expand_timeout_secs: 120,
            delete_timeout_secs: 60,
            list_page_size: 100,
        }
    }
}

/// Node service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    /// Identity of this node; required in node mode
    pub node_id: Option<String>,
    /// Directory for persisted publish records; records live in memory only
    /// when unset
    pub state_dir: Option<PathBuf>,
    /// Volumes this node accepts, 0 for no limit
    pub max_volumes_per_node: i64,
    /// iSCSI login attempts before giving up
    pub login_attempts: u32,
    /// Delay before the first login retry, in milliseconds
    pub login_retry_ms: u64,
}

impl NodeConfig {
    pub fn login_retry(&self) -> Duration {
        Duration::from_millis(self.login_retry_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            state_dir: None,
            max_volumes_per_node: 0,
            login_attempts: 5,
            login_retry_ms: 500,
        }
    }
}

/// RPC listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Loopback address the orchestrator's sidecars connect to
    pub endpoint: SocketAddr,
    /// Hard upper bound on one RPC, in seconds
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from(([127, 0, 0, 1], 10000)),
            request_timeout_secs: 300,
        }
    }
}
