//! Publish Record Registry
//!
//! What this node has staged and published, keyed by volume id. Records can
//! be mirrored to a state directory (one JSON file per volume) so a
//! restarted node plugin knows which sessions and mounts it owns.

use crate::crd::{AccessType, FsType};
use crate::domain::ports::IscsiTarget;
use crate::error::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "json";

/// A volume staged on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRecord {
    pub volume_id: String,
    pub node_id: String,
    pub staging_path: PathBuf,
    /// Block device exposed by the iSCSI session
    pub device_path: PathBuf,
    pub target: IscsiTarget,
    pub access_type: AccessType,
    #[serde(default)]
    pub read_only: bool,
    /// Target paths the volume is currently published at
    #[serde(default)]
    pub targets: BTreeSet<PathBuf>,
    /// Written before login and cleared once the staging mount is in
    /// place. A pending record still owns the iSCSI session, so unstage
    /// logs it out.
    #[serde(default)]
    pub pending: bool,
}

impl PublishRecord {
    pub fn fs_type(&self) -> Option<FsType> {
        match &self.access_type {
            AccessType::Mount { fs_type, .. } => Some(*fs_type),
            AccessType::Block => None,
        }
    }

    pub fn is_published(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

/// Concurrent map of publish records with optional on-disk mirror
#[derive(Debug, Default)]
pub struct PublishRecords {
    records: DashMap<String, PublishRecord>,
    state_dir: Option<PathBuf>,
}

impl PublishRecords {
    /// Records kept in memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Records mirrored under `state_dir`
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            records: DashMap::new(),
            state_dir: Some(state_dir.into()),
        }
    }

    pub fn get(&self, volume_id: &str) -> Option<PublishRecord> {
        self.records.get(volume_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn volume_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    /// Store `record`, replacing any previous one for the volume
    pub async fn insert(&self, record: PublishRecord) -> Result<()> {
        self.persist(&record).await?;
        self.records.insert(record.volume_id.clone(), record);
        Ok(())
    }

    /// Apply `f` to the record for `volume_id`, if there is one
    pub async fn update<F>(&self, volume_id: &str, f: F) -> Result<Option<PublishRecord>>
    where
        F: FnOnce(&mut PublishRecord),
    {
        let mut record = match self.get(volume_id) {
            Some(record) => record,
            None => return Ok(None),
        };
        f(&mut record);
        self.persist(&record).await?;
        self.records.insert(volume_id.to_string(), record.clone());
        Ok(Some(record))
    }

    pub async fn remove(&self, volume_id: &str) -> Result<Option<PublishRecord>> {
        if let Some(path) = self.record_path(volume_id) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.records.remove(volume_id).map(|(_, record)| record))
    }

    /// Load every record found in the state directory. Unreadable files are
    /// skipped; returns how many records were loaded.
    pub async fn recover(&self) -> Result<usize> {
        let dir = match &self.state_dir {
            Some(dir) => dir,
            None => return Ok(0),
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match load_record(&path).await {
                Ok(record) => {
                    debug!(volume = %record.volume_id, staging = %record.staging_path.display(), "recovered publish record");
                    self.records.insert(record.volume_id.clone(), record);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable publish record");
                }
            }
        }
        info!(records = loaded, dir = %dir.display(), "publish records recovered");
        Ok(loaded)
    }

    fn record_path(&self, volume_id: &str) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}.{}",
                urlencoding::encode(volume_id),
                RECORD_EXTENSION
            ))
        })
    }

    /// Write-then-rename so a crash never leaves a torn record
    async fn persist(&self, record: &PublishRecord) -> Result<()> {
        let path = match self.record_path(&record.volume_id) {
            Some(path) => path,
            None => return Ok(()),
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn load_record(path: &Path) -> Result<PublishRecord> {
    let contents = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&contents)?)
}
