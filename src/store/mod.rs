//! Volume Resource Client
//!
//! Implementations of [`VolumeStore`] plus the read-modify-write and
//! wait helpers the services build on:
//! - [`KubeVolumeStore`]: JivaVolume custom resources in the cluster
//! - [`MemoryVolumeStore`]: process-local store for standalone mode and tests

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeVolumeStore;
pub use memory::MemoryVolumeStore;

use crate::crd::JivaVolume;
use crate::domain::ports::{VolumeEvent, VolumeStore};
use crate::error::{Error, Result};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Attempts made by [`modify_status`] before a write conflict is surfaced
pub const MAX_CONFLICT_RETRIES: usize = 3;

impl VolumeEvent {
    /// Name of the volume the event is about
    pub fn name(&self) -> &str {
        match self {
            VolumeEvent::Applied(volume) => volume.name(),
            VolumeEvent::Deleted(name) => name,
        }
    }
}

/// Read a volume, apply `mutate` to it and write the status back.
///
/// A write that loses a compare-and-set race is retried from a fresh read a
/// bounded number of times; `mutate` is re-run against the new state, so it
/// must validate rather than assume.
pub async fn modify_status<F>(store: &dyn VolumeStore, name: &str, mut mutate: F) -> Result<JivaVolume>
where
    F: FnMut(&mut JivaVolume) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut volume = store
            .get(name)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;
        mutate(&mut volume)?;

        match store.update_status(&volume).await {
            Ok(updated) => return Ok(updated),
            Err(Error::VersionConflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                debug!(volume = name, attempt, "status write conflicted, re-reading");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wait until `name` no longer exists in the store, or `timeout` elapses.
pub async fn wait_for_deletion(store: &dyn VolumeStore, name: &str, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut events = store.watch(name).await?;

    // The delete may already have completed before the watch started
    if store.get(name).await?.is_none() {
        return Ok(());
    }

    let deadline = started + timeout;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(VolumeEvent::Deleted(_))) => return Ok(()),
                Some(Ok(VolumeEvent::Applied(_))) => continue,
                Some(Err(e)) => {
                    warn!(volume = name, error = %e, "watch failed, falling back to a read");
                    return match store.get(name).await? {
                        None => Ok(()),
                        Some(_) => Err(e),
                    };
                }
                None => {
                    return match store.get(name).await? {
                        None => Ok(()),
                        Some(_) => Err(Error::Internal(format!("watch of {} ended", name))),
                    };
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::DeadlineExceeded {
                    what: format!("removal of volume {}", name),
                    elapsed: started.elapsed(),
                });
            }
        }
    }
}
