//! Per-Volume Lock Registry
//!
//! Serializes mutating operations keyed by volume id. A lock is exclusive,
//! non-reentrant and never waited on: a second request for a held key fails
//! at once with [`Error::OperationInProgress`] so the orchestrator's own
//! backoff decides when to try again.
//!
//! The lock is released when its [`VolumeLockGuard`] is dropped, which covers
//! early returns, errors and a handler future being dropped on cancellation.

use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Who holds a key and since when
#[derive(Debug, Clone)]
struct Holder {
    operation: &'static str,
    acquired_at: Instant,
}

/// Registry of held volume locks
#[derive(Debug, Clone, Default)]
pub struct VolumeLocks {
    held: Arc<DashMap<String, Holder>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` or fail fast if it is held
    pub fn try_lock(&self, key: impl Into<String>, operation: &'static str) -> Result<VolumeLockGuard> {
        let key = key.into();
        match self.held.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let holder = entry.get();
                warn!(
                    key = %key,
                    operation,
                    held_by = holder.operation,
                    held_for_ms = holder.acquired_at.elapsed().as_millis() as u64,
                    "operation already in progress"
                );
                Err(Error::OperationInProgress { key })
            }
            Entry::Vacant(entry) => {
                entry.insert(Holder {
                    operation,
                    acquired_at: Instant::now(),
                });
                debug!(key = %key, operation, "volume lock acquired");
                Ok(VolumeLockGuard {
                    held: self.held.clone(),
                    key,
                })
            }
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Key for node-local operations, which are serialized per (volume, node)
pub fn node_key(volume_id: &str, node_id: &str) -> String {
    format!("{}@{}", volume_id, node_id)
}

/// Releases its key on drop
#[derive(Debug)]
pub struct VolumeLockGuard {
    held: Arc<DashMap<String, Holder>>,
    key: String,
}

impl VolumeLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        if let Some((_, holder)) = self.held.remove(&self.key) {
            debug!(
                key = %self.key,
                operation = holder.operation,
                held_ms = holder.acquired_at.elapsed().as_millis() as u64,
                "volume lock released"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_second_acquire_fails_fast() {
        let locks = VolumeLocks::new();
        let guard = locks.try_lock("v1", "CreateVolume").unwrap();
        assert_eq!(guard.key(), "v1");

        let err = locks.try_lock("v1", "DeleteVolume").unwrap_err();
        assert_matches!(err, Error::OperationInProgress { key } if key == "v1");

        // Other keys are independent
        let _other = locks.try_lock("v2", "CreateVolume").unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_release_on_drop() {
        let locks = VolumeLocks::new();
        {
            let _guard = locks.try_lock("v1", "CreateVolume").unwrap();
            assert!(locks.is_locked("v1"));
        }
        assert!(!locks.is_locked("v1"));
        assert!(locks.try_lock("v1", "CreateVolume").is_ok());
    }

    #[test]
    fn test_release_on_error_path() {
        fn failing(locks: &VolumeLocks) -> Result<()> {
            let _guard = locks.try_lock("v1", "ControllerExpandVolume")?;
            Err(Error::Internal("boom".into()))
        }

        let locks = VolumeLocks::new();
        assert!(failing(&locks).is_err());
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_release_when_future_is_dropped() {
        let locks = VolumeLocks::new();
        let task_locks = locks.clone();
        let handle = tokio::spawn(async move {
            let _guard = task_locks.try_lock("v1", "CreateVolume").unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });

        while !locks.is_locked("v1") {
            tokio::task::yield_now().await;
        }
        handle.abort();
        let _ = handle.await;
        assert!(!locks.is_locked("v1"));
    }

    #[test]
    fn test_node_key() {
        assert_eq!(node_key("v1", "node-a"), "v1@node-a");
    }
}
