//! Kubernetes Volume Store
//!
//! [`VolumeStore`] over the namespaced `JivaVolume` custom resource. The
//! status subresource carries the lifecycle; the resource's desired fields
//! are written once at creation. Status writes send the resourceVersion that was read, so the
//! API server rejects a write that lost a race with HTTP 409.

use crate::crd::JivaVolume;
use crate::domain::ports::{VolumeEvent, VolumePage, VolumeStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{debug, instrument};

/// Volume store backed by the cluster's API server
#[derive(Clone)]
pub struct KubeVolumeStore {
    api: Api<JivaVolume>,
    namespace: String,
}

impl KubeVolumeStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn write_status(&self, volume: &JivaVolume) -> Result<JivaVolume> {
        let name = volume.name();
        let body = serde_json::to_vec(volume)?;
        self.api
            .replace_status(name, &PostParams::default(), body)
            .await
            .map_err(|e| map_api_error(e, name))
    }
}

impl std::fmt::Debug for KubeVolumeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeVolumeStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Translate API server status codes the store contract names explicitly
fn map_api_error(err: kube::Error, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::VolumeNotFound(name.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => Error::VersionConflict {
            kind: "JivaVolume".into(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

/// Expand one watcher event into volume events
fn convert_event(event: watcher::Event<JivaVolume>, name: &str) -> Vec<Result<VolumeEvent>> {
    match event {
        watcher::Event::Applied(volume) => vec![Ok(VolumeEvent::Applied(volume))],
        watcher::Event::Deleted(volume) => {
            vec![Ok(VolumeEvent::Deleted(volume.name().to_string()))]
        }
        // A relist that no longer contains the object means it is gone
        watcher::Event::Restarted(volumes) => {
            if volumes.is_empty() {
                vec![Ok(VolumeEvent::Deleted(name.to_string()))]
            } else {
                volumes
                    .into_iter()
                    .map(|v| Ok(VolumeEvent::Applied(v)))
                    .collect()
            }
        }
    }
}

#[async_trait]
impl VolumeStore for KubeVolumeStore {
    async fn get(&self, name: &str) -> Result<Option<JivaVolume>> {
        Ok(self.api.get_opt(name).await?)
    }

    #[instrument(skip(self, volume), fields(volume = %volume.name()))]
    async fn create(&self, volume: &JivaVolume) -> Result<JivaVolume> {
        let name = volume.name();
        let created = match self.api.create(&PostParams::default(), volume).await {
            Ok(created) => created,
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                return Err(Error::AlreadyExists {
                    name: name.to_string(),
                    reason: "resource exists".into(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        // The API server drops status on create; write it separately
        let mut with_status = created;
        with_status.status = volume.status.clone();
        let stored = self.write_status(&with_status).await?;
        debug!(resource_version = ?stored.metadata.resource_version, "volume resource created");
        Ok(stored)
    }

    async fn update_status(&self, volume: &JivaVolume) -> Result<JivaVolume> {
        self.write_status(volume).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<bool> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, limit: u32, continue_token: Option<String>) -> Result<VolumePage> {
        let mut params = ListParams::default();
        if limit > 0 {
            params = params.limit(limit);
        }
        if let Some(token) = continue_token.as_deref() {
            params = params.continue_token(token);
        }

        let list = self.api.list(&params).await?;
        let continue_token = list.metadata.continue_.filter(|t| !t.is_empty());
        Ok(VolumePage {
            volumes: list.items,
            continue_token,
        })
    }

    async fn watch(&self, name: &str) -> Result<BoxStream<'static, Result<VolumeEvent>>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let name = name.to_string();
        let events = watcher(self.api.clone(), config).flat_map(move |event| {
            let converted = match event {
                Ok(event) => convert_event(event, &name),
                Err(e) => vec![Err(Error::Internal(format!("volume watch failed: {}", e)))],
            };
            stream::iter(converted)
        });
        Ok(events.boxed())
    }
}
