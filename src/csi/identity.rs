//! Identity service: plugin discovery and readiness

use super::types::{
    GetPluginCapabilitiesResponse, GetPluginInfoResponse, PluginCapability, ProbeResponse,
};
use crate::domain::ports::VolumeStoreRef;
use crate::error::Result;
use std::collections::BTreeMap;
use tracing::warn;

pub struct IdentityService {
    driver_name: String,
    store: VolumeStoreRef,
    controller: bool,
}

impl IdentityService {
    /// `controller` says whether this process also serves the controller
    /// service, which changes the advertised capabilities
    pub fn new(driver_name: impl Into<String>, store: VolumeStoreRef, controller: bool) -> Self {
        Self {
            driver_name: driver_name.into(),
            store,
            controller,
        }
    }

    pub async fn get_plugin_info(&self) -> Result<GetPluginInfoResponse> {
        let mut manifest = BTreeMap::new();
        manifest.insert("backend".to_string(), "jiva".to_string());
        Ok(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: crate::VERSION.to_string(),
            manifest,
        })
    }

    pub async fn get_plugin_capabilities(&self) -> Result<GetPluginCapabilitiesResponse> {
        let mut capabilities = Vec::new();
        if self.controller {
            capabilities.push(PluginCapability::ControllerService);
        }
        capabilities.push(PluginCapability::OnlineVolumeExpansion);
        Ok(GetPluginCapabilitiesResponse { capabilities })
    }

    /// Ready once the volume store answers a minimal list
    pub async fn probe(&self) -> Result<ProbeResponse> {
        let ready = match self.store.list(1, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "volume store not reachable");
                false
            }
        };
        Ok(ProbeResponse { ready })
    }
}
