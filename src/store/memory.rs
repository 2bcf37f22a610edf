//! In-Memory Volume Store
//!
//! Process-local [`VolumeStore`] with the same compare-and-set semantics as
//! the Kubernetes API: every write bumps `metadata.resourceVersion`, and a
//! status write carrying a stale version is rejected.

use crate::crd::JivaVolume;
use crate::domain::ports::{VolumeEvent, VolumePage, VolumeStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Inner {
    volumes: RwLock<BTreeMap<String, JivaVolume>>,
    version: AtomicU64,
    events: broadcast::Sender<VolumeEvent>,
}

/// Volume store kept in process memory
#[derive(Debug, Clone)]
pub struct MemoryVolumeStore {
    inner: Arc<Inner>,
}

impl Default for MemoryVolumeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                volumes: RwLock::new(BTreeMap::new()),
                version: AtomicU64::new(0),
                events,
            }),
        }
    }

    fn next_version(&self) -> String {
        (self.inner.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: VolumeEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Number of stored volumes
    pub fn len(&self) -> usize {
        self.inner.volumes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.volumes.read().is_empty()
    }

    /// Overwrite a volume regardless of its version, as a foreign writer would
    #[cfg(test)]
    pub(crate) fn force_update(&self, mut volume: JivaVolume) {
        volume.metadata.resource_version = Some(self.next_version());
        let name = volume.name().to_string();
        self.inner.volumes.write().insert(name, volume.clone());
        self.publish(VolumeEvent::Applied(volume));
    }
}

#[async_trait]
impl VolumeStore for MemoryVolumeStore {
    async fn get(&self, name: &str) -> Result<Option<JivaVolume>> {
        Ok(self.inner.volumes.read().get(name).cloned())
    }

    async fn create(&self, volume: &JivaVolume) -> Result<JivaVolume> {
        let name = volume.name().to_string();
        let created = {
            let mut volumes = self.inner.volumes.write();
            if volumes.contains_key(&name) {
                return Err(Error::AlreadyExists {
                    name,
                    reason: "resource exists".into(),
                });
            }
            let mut created = volume.clone();
            created.metadata.resource_version = Some(self.next_version());
            created.metadata.creation_timestamp = Some(Time(Utc::now()));
            volumes.insert(name, created.clone());
            created
        };
        self.publish(VolumeEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update_status(&self, volume: &JivaVolume) -> Result<JivaVolume> {
        let name = volume.name().to_string();
        let updated = {
            let mut volumes = self.inner.volumes.write();
            let stored = volumes
                .get_mut(&name)
                .ok_or_else(|| Error::VolumeNotFound(name.clone()))?;
            if stored.metadata.resource_version != volume.metadata.resource_version {
                return Err(Error::VersionConflict {
                    kind: "JivaVolume".into(),
                    name,
                });
            }
            stored.status = volume.status.clone();
            stored.metadata.resource_version = Some(self.next_version());
            stored.clone()
        };
        self.publish(VolumeEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let existed = self.inner.volumes.write().remove(name).is_some();
        if existed {
            self.publish(VolumeEvent::Deleted(name.to_string()));
        }
        Ok(existed)
    }

    async fn list(&self, limit: u32, continue_token: Option<String>) -> Result<VolumePage> {
        let volumes = self.inner.volumes.read();
        let start = match &continue_token {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Unbounded,
        };
        let take = if limit == 0 { usize::MAX } else { limit as usize };

        let mut range = volumes.range((start, Bound::Unbounded));
        let page: Vec<JivaVolume> = range.by_ref().take(take).map(|(_, v)| v.clone()).collect();
        let continue_token = match range.next() {
            Some(_) => page.last().map(|v| v.name().to_string()),
            None => None,
        };

        Ok(VolumePage {
            volumes: page,
            continue_token,
        })
    }

    async fn watch(&self, name: &str) -> Result<BoxStream<'static, Result<VolumeEvent>>> {
        let rx = self.inner.events.subscribe();
        let initial = self
            .inner
            .volumes
            .read()
            .get(name)
            .cloned()
            .map(|v| Ok(VolumeEvent::Applied(v)));

        let changes = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "volume watch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        let name = name.to_string();
        let filtered = changes.filter(move |event: &Result<VolumeEvent>| {
            let keep = match event {
                Ok(event) => event.name() == name,
                Err(_) => true,
            };
            futures::future::ready(keep)
        });

        Ok(stream::iter(initial).chain(filtered).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AccessMode, AccessType, JivaVolumeSpec, VolumePhase};
    use assert_matches::assert_matches;

    fn volume(name: &str) -> JivaVolume {
        JivaVolume::creating(
            name,
            "jiva",
            JivaVolumeSpec {
                capacity_bytes: 1 << 30,
                replica_count: 1,
                access_mode: AccessMode::SingleNodeWriter,
                access_type: AccessType::default(),
                parameters: BTreeMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemoryVolumeStore::new();
        let created = store.create(&volume("v1")).await.unwrap();
        assert!(created.metadata.resource_version.is_some());
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.create(&volume("v1")).await.unwrap_err();
        assert_matches!(err, Error::AlreadyExists { .. });

        assert!(store.get("v1").await.unwrap().is_some());
        assert!(store.delete("v1").await.unwrap());
        assert!(!store.delete("v1").await.unwrap());
        assert!(store.get("v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_status_write_rejected() {
        let store = MemoryVolumeStore::new();
        let created = store.create(&volume("v1")).await.unwrap();

        let mut first = created.clone();
        first.transition(VolumePhase::Ready, None).unwrap();
        store.update_status(&first).await.unwrap();

        // Still carries the version read before the first write
        let mut stale = created;
        stale.transition(VolumePhase::Error, None).unwrap();
        let err = store.update_status(&stale).await.unwrap_err();
        assert_matches!(err, Error::VersionConflict { .. });

        let stored = store.get("v1").await.unwrap().unwrap();
        assert_eq!(stored.phase(), VolumePhase::Ready);
    }

    #[tokio::test]
    async fn test_list_pages() {
        let store = MemoryVolumeStore::new();
        for name in ["a", "b", "c", "d", "e"] {
            store.create(&volume(name)).await.unwrap();
        }

        let first = store.list(2, None).await.unwrap();
        assert_eq!(first.volumes.len(), 2);
        assert_eq!(first.continue_token.as_deref(), Some("b"));

        let second = store.list(2, first.continue_token).await.unwrap();
        assert_eq!(second.volumes[0].name(), "c");

        let last = store.list(2, second.continue_token).await.unwrap();
        assert_eq!(last.volumes.len(), 1);
        assert!(last.continue_token.is_none());

        let all = store.list(0, None).await.unwrap();
        assert_eq!(all.volumes.len(), 5);
        assert!(all.continue_token.is_none());
    }

    #[tokio::test]
    async fn test_watch_filters_by_name() {
        let store = MemoryVolumeStore::new();
        store.create(&volume("v1")).await.unwrap();

        let mut events = store.watch("v1").await.unwrap();
        // Current state comes first
        assert_matches!(events.next().await, Some(Ok(VolumeEvent::Applied(v))) if v.name() == "v1");

        store.create(&volume("other")).await.unwrap();
        store.delete("other").await.unwrap();
        store.delete("v1").await.unwrap();

        assert_matches!(events.next().await, Some(Ok(VolumeEvent::Deleted(name))) if name == "v1");
    }
}
