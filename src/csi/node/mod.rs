//! Node service
//!
//! Attaches volumes to this host: iSCSI login, filesystem creation and the
//! staging mount on NodeStage, bind mounts on NodePublish, and filesystem
//! growth on NodeExpand. Every mutating call locks `volume@node`, and what
//! was staged is tracked in [`PublishRecords`].

pub mod records;

pub use records::{PublishRecord, PublishRecords};

use super::types::{
    Empty, NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetCapabilitiesResponse, NodeGetInfoResponse, NodePublishVolumeRequest,
    NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
    VolumeCapability,
};
use super::CallContext;
use crate::config::NodeConfig;
use crate::crd::{AccessType, VolumePhase};
use crate::domain::ports::{ensure_mount_point, HostOpsRef, IscsiTarget, VolumeStoreRef};
use crate::error::{Error, Result};
use crate::lock::{node_key, VolumeLocks};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct NodeService {
    node_id: String,
    store: VolumeStoreRef,
    host: HostOpsRef,
    locks: VolumeLocks,
    records: Arc<PublishRecords>,
    max_volumes_per_node: i64,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        store: VolumeStoreRef,
        host: HostOpsRef,
        locks: VolumeLocks,
        records: Arc<PublishRecords>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            host,
            locks,
            records,
            max_volumes_per_node: config.max_volumes_per_node,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn records(&self) -> &PublishRecords {
        &self.records
    }

    // =========================================================================
    // NodeStageVolume / NodeUnstageVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume = %req.volume_id, node = %self.node_id))]
    pub async fn node_stage_volume(&self, ctx: &CallContext, req: NodeStageVolumeRequest) -> Result<Empty> {
        let id = required_id(&req.volume_id)?;
        required_path(&req.staging_target_path, "staging target path")?;
        let capability = required_capability(req.volume_capability.as_ref())?;
        let _guard = self.locks.try_lock(node_key(id, &self.node_id), "NodeStageVolume")?;

        let previous = self.records.get(id);
        if let Some(record) = &previous {
            if record.staging_path != req.staging_target_path {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} is already staged at {}",
                    id,
                    record.staging_path.display()
                )));
            }
            if self.is_staged(record).await? {
                debug!("volume already staged");
                return Ok(Empty {});
            }
            info!(pending = record.is_pending(), "staging incomplete, restaging");
        }

        let volume = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;
        if !volume.phase().is_usable() {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is {} and cannot be staged",
                id,
                volume.phase()
            )));
        }
        let endpoint = volume.endpoint().ok_or_else(|| {
            Error::FailedPrecondition(format!("volume {} has no backend endpoint", id))
        })?;
        if !capability.access_type.is_compatible(&volume.spec.access_type) {
            return Err(Error::InvalidArgument(
                "access type does not match the volume".into(),
            ));
        }
        let target = IscsiTarget::from(endpoint);
        let staging = req.staging_target_path.as_path();
        let access_type = &capability.access_type;

        // Claim the session before logging in, so an unstage after an
        // abandoned stage still knows to log out
        let mut record = PublishRecord {
            volume_id: id.to_string(),
            node_id: self.node_id.clone(),
            staging_path: req.staging_target_path.clone(),
            device_path: previous
                .as_ref()
                .map(|r| r.device_path.clone())
                .unwrap_or_default(),
            target: target.clone(),
            access_type: access_type.clone(),
            read_only: volume.spec.access_mode.is_read_only(),
            targets: previous
                .as_ref()
                .map(|r| r.targets.clone())
                .unwrap_or_else(BTreeSet::new),
            pending: true,
        };
        self.records.insert(record.clone()).await?;

        let staged = ctx
            .run(id, "staging", async {
                let device = self.host.login(&target).await?;
                self.prepare_staging(&device, staging, access_type).await?;
                Ok::<_, Error>(device)
            })
            .await;
        let device = match staged {
            Ok(device) => device,
            Err(e) => {
                self.abandon_stage(id, previous, &target, staging, access_type).await;
                return Err(e);
            }
        };

        record.device_path = device;
        record.pending = false;
        if let Err(e) = self.records.insert(record).await {
            self.abandon_stage(id, previous, &target, staging, access_type).await;
            return Err(e);
        }

        info!(target = %target, "volume staged");
        Ok(Empty {})
    }

    /// Undo a stage that did not complete and put back what was recorded
    /// before it started
    async fn abandon_stage(
        &self,
        id: &str,
        previous: Option<PublishRecord>,
        target: &IscsiTarget,
        staging: &Path,
        access_type: &AccessType,
    ) {
        self.undo_stage(target, staging, access_type).await;
        let restored = match previous {
            Some(record) => self.records.insert(record).await,
            None => self.records.remove(id).await.map(|_| ()),
        };
        if let Err(e) = restored {
            warn!(target = %target, error = %e, "could not reset publish record");
        }
    }

    async fn is_staged(&self, record: &PublishRecord) -> Result<bool> {
        if record.is_pending() {
            return Ok(false);
        }
        match record.access_type {
            AccessType::Block => Ok(true),
            AccessType::Mount { .. } => self.host.is_mounted(&record.staging_path).await,
        }
    }

    /// Make sure the device carries the requested filesystem and mount it
    /// at the staging path. An existing filesystem is never reformatted.
    async fn prepare_staging(&self, device: &Path, staging: &Path, access_type: &AccessType) -> Result<()> {
        let (fs_type, mount_flags) = match access_type {
            AccessType::Block => return Ok(()),
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => (*fs_type, mount_flags),
        };

        match self.host.probe_fs(device).await? {
            None => self.host.format(device, fs_type).await?,
            Some(existing) if existing == fs_type.to_string() => {
                debug!(device = %device.display(), fs = %existing, "reusing existing filesystem");
            }
            Some(existing) => {
                return Err(Error::FailedPrecondition(format!(
                    "device {} holds {} and will not be reformatted as {}",
                    device.display(),
                    existing,
                    fs_type
                )));
            }
        }

        ensure_mount_point(staging, access_type).await?;
        if !self.host.is_mounted(staging).await? {
            self.host.mount(device, staging, fs_type, mount_flags).await?;
        }
        Ok(())
    }

    /// Roll back a partial stage; the original failure is what gets reported
    async fn undo_stage(&self, target: &IscsiTarget, staging: &Path, access_type: &AccessType) {
        if !access_type.is_block() {
            if let Err(e) = self.host.unmount(staging).await {
                warn!(staging = %staging.display(), error = %e, "cleanup unmount failed");
            }
        }
        if let Err(e) = self.host.logout(target).await {
            warn!(target = %target, error = %e, "cleanup logout failed");
        }
    }

    #[instrument(skip(self, ctx, req), fields(volume = %req.volume_id, node = %self.node_id))]
    pub async fn node_unstage_volume(&self, ctx: &CallContext, req: NodeUnstageVolumeRequest) -> Result<Empty> {
        let id = required_id(&req.volume_id)?;
        required_path(&req.staging_target_path, "staging target path")?;
        let _guard = self.locks.try_lock(node_key(id, &self.node_id), "NodeUnstageVolume")?;

        let record = match self.records.get(id) {
            Some(record) => record,
            None => {
                // Nothing recorded; clear a leftover mount from an earlier run
                ctx.run(id, "unmount", self.host.unmount(&req.staging_target_path))
                    .await?;
                debug!("volume not staged");
                return Ok(Empty {});
            }
        };
        if record.staging_path != req.staging_target_path {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is staged at {}, not {}",
                id,
                record.staging_path.display(),
                req.staging_target_path.display()
            )));
        }
        if record.is_published() {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is still published at {} target path(s)",
                id,
                record.targets.len()
            )));
        }

        ctx.run(id, "unstaging", async {
            if !record.access_type.is_block() {
                self.host.unmount(&record.staging_path).await?;
            }
            self.host.logout(&record.target).await
        })
        .await?;
        self.records.remove(id).await?;

        info!(pending = record.is_pending(), "volume unstaged");
        Ok(Empty {})
    }

    // =========================================================================
    // NodePublishVolume / NodeUnpublishVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume = %req.volume_id, target = %req.target_path.display()))]
    pub async fn node_publish_volume(&self, ctx: &CallContext, req: NodePublishVolumeRequest) -> Result<Empty> {
        let id = required_id(&req.volume_id)?;
        required_path(&req.staging_target_path, "staging target path")?;
        required_path(&req.target_path, "target path")?;
        let capability = required_capability(req.volume_capability.as_ref())?;
        let _guard = self.locks.try_lock(node_key(id, &self.node_id), "NodePublishVolume")?;

        let record = self
            .records
            .get(id)
            .filter(|r| !r.is_pending())
            .ok_or_else(|| {
                Error::FailedPrecondition(format!("volume {} is not staged on node {}", id, self.node_id))
            })?;
        if record.staging_path != req.staging_target_path {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is staged at {}, not {}",
                id,
                record.staging_path.display(),
                req.staging_target_path.display()
            )));
        }
        if !capability.access_type.is_compatible(&record.access_type) {
            return Err(Error::InvalidArgument(
                "access type does not match the staged volume".into(),
            ));
        }

        let target_path = req.target_path.as_path();
        let mounted = self.host.is_mounted(target_path).await?;
        if mounted && record.targets.contains(target_path) {
            debug!("volume already published");
            return Ok(Empty {});
        }

        let read_only = req.readonly || record.read_only;
        if !mounted {
            ensure_mount_point(target_path, &record.access_type).await?;
            let source = match record.access_type {
                AccessType::Block => &record.device_path,
                AccessType::Mount { .. } => &record.staging_path,
            };
            ctx.run(id, "bind mount", self.host.bind_mount(source, target_path, read_only))
                .await?;
        }

        let added = req.target_path.clone();
        if let Err(e) = self
            .records
            .update(id, |r| {
                r.targets.insert(added);
            })
            .await
        {
            if let Err(cleanup) = self.host.unmount(target_path).await {
                warn!(error = %cleanup, "cleanup unmount failed");
            }
            return Err(e);
        }

        info!(read_only, "volume published");
        Ok(Empty {})
    }

    #[instrument(skip(self, ctx, req), fields(volume = %req.volume_id, target = %req.target_path.display()))]
    pub async fn node_unpublish_volume(&self, ctx: &CallContext, req: NodeUnpublishVolumeRequest) -> Result<Empty> {
        let id = required_id(&req.volume_id)?;
        required_path(&req.target_path, "target path")?;
        let _guard = self.locks.try_lock(node_key(id, &self.node_id), "NodeUnpublishVolume")?;

        ctx.run(id, "unmount", self.host.unmount(&req.target_path)).await?;
        let removed = req.target_path.clone();
        self.records
            .update(id, |r| {
                r.targets.remove(&removed);
            })
            .await?;
        remove_target_path(&req.target_path).await?;

        info!("volume unpublished");
        Ok(Empty {})
    }

    // =========================================================================
    // NodeExpandVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume = %req.volume_id, node = %self.node_id))]
    pub async fn node_expand_volume(
        &self,
        ctx: &CallContext,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse> {
        let id = required_id(&req.volume_id)?;
        required_path(&req.volume_path, "volume path")?;
        let _guard = self.locks.try_lock(node_key(id, &self.node_id), "NodeExpandVolume")?;

        let record = self
            .records
            .get(id)
            .filter(|r| !r.is_pending())
            .ok_or_else(|| Error::VolumeNotFound(format!("{} on node {}", id, self.node_id)))?;
        if req.volume_path != record.staging_path && !record.targets.contains(&req.volume_path) {
            return Err(Error::VolumeNotFound(format!(
                "{} at {}",
                id,
                req.volume_path.display()
            )));
        }

        let volume = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;
        if volume.phase() == VolumePhase::Resizing {
            return Err(Error::FailedPrecondition(format!(
                "controller expansion of volume {} is still in progress",
                id
            )));
        }

        let capacity = volume.current_capacity();
        let requested = match req.capacity_range {
            Some(range) => range.resolve(0)?,
            None => 0,
        };
        if requested > capacity {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is {} bytes; controller expansion to {} bytes has not completed",
                id, capacity, requested
            )));
        }
        let wanted = if requested == 0 { capacity } else { requested };

        let device_size = ctx
            .run(id, "rescan", async {
                self.host.rescan(&record.target).await?;
                self.host.device_size(&record.device_path).await
            })
            .await?;
        if device_size < wanted {
            return Err(Error::FailedPrecondition(format!(
                "device {} reports {} bytes, expected at least {}",
                record.device_path.display(),
                device_size,
                wanted
            )));
        }

        if let Some(fs_type) = record.fs_type() {
            ctx.run(
                id,
                "filesystem growth",
                self.host.grow_fs(&record.device_path, &req.volume_path, fs_type),
            )
            .await?;
        }

        info!(capacity_bytes = device_size, "volume expanded on node");
        Ok(NodeExpandVolumeResponse {
            capacity_bytes: device_size,
        })
    }

    // =========================================================================
    // NodeGetCapabilities / NodeGetInfo
    // =========================================================================

    pub fn node_get_capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse {
            capabilities: vec![NodeCapability::StageUnstageVolume, NodeCapability::ExpandVolume],
        }
    }

    pub fn node_get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
        }
    }
}

fn required_id(id: &str) -> Result<&str> {
    if id.trim().is_empty() {
        return Err(Error::InvalidArgument("volume id missing".into()));
    }
    Ok(id)
}

fn required_path(path: &Path, what: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgument(format!("{} missing", what)));
    }
    Ok(())
}

fn required_capability(capability: Option<&VolumeCapability>) -> Result<&VolumeCapability> {
    capability.ok_or_else(|| Error::InvalidArgument("volume capability missing".into()))
}

/// Remove the directory or file the orchestrator created for a target
async fn remove_target_path(path: &Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AccessMode, FsType, JivaVolume, JivaVolumeSpec};
    use crate::csi::types::CapacityRange;
    use crate::domain::ports::VolumeStore;
    use crate::error::Code;
    use crate::store::{modify_status, MemoryVolumeStore};
    use crate::testing::{FakeBackend, FakeHost};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const GIB: u64 = 1 << 30;

    struct Harness {
        service: NodeService,
        store: Arc<MemoryVolumeStore>,
        host: Arc<FakeHost>,
        dir: TempDir,
    }

    impl Harness {
        fn staging(&self) -> PathBuf {
            self.dir.path().join("staging/pvc-1")
        }

        fn target(&self, pod: &str) -> PathBuf {
            self.dir.path().join("pods").join(pod).join("mount")
        }
    }

    fn mount_capability() -> VolumeCapability {
        VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::default(),
        }
    }

    fn block_capability() -> VolumeCapability {
        VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Block,
        }
    }

    async fn add_volume(store: &MemoryVolumeStore, name: &str, access_type: AccessType, phase: VolumePhase) {
        let mut volume = JivaVolume::creating(
            name,
            "jiva",
            JivaVolumeSpec {
                capacity_bytes: GIB,
                replica_count: 3,
                access_mode: AccessMode::SingleNodeWriter,
                access_type,
                parameters: BTreeMap::new(),
            },
        );
        let status = volume.status_mut();
        status.phase = phase;
        status.capacity_bytes = GIB;
        status.endpoint = Some(FakeBackend::endpoint(name));
        store.create(&volume).await.unwrap();
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryVolumeStore::new());
        add_volume(&store, "pvc-1", AccessType::default(), VolumePhase::Published).await;
        let host = Arc::new(FakeHost::new());
        let service = NodeService::new(
            "node-a",
            store.clone(),
            host.clone(),
            VolumeLocks::new(),
            Arc::new(PublishRecords::new()),
            &NodeConfig::default(),
        );
        Harness {
            service,
            store,
            host,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn stage_request(h: &Harness, capability: VolumeCapability) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "pvc-1".into(),
            staging_target_path: h.staging(),
            volume_capability: Some(capability),
            publish_context: BTreeMap::new(),
        }
    }

    fn publish_request(h: &Harness, pod: &str, capability: VolumeCapability) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "pvc-1".into(),
            staging_target_path: h.staging(),
            target_path: h.target(pod),
            volume_capability: Some(capability),
            readonly: false,
        }
    }

    fn unstage_request(h: &Harness) -> NodeUnstageVolumeRequest {
        NodeUnstageVolumeRequest {
            volume_id: "pvc-1".into(),
            staging_target_path: h.staging(),
        }
    }

    #[tokio::test]
    async fn test_repeated_stage_logs_in_and_formats_once() {
        let h = harness().await;
        let ctx = CallContext::new();

        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();
        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();

        assert_eq!(h.host.logins(), 1);
        assert_eq!(h.host.formats(), 1);
        assert!(h.host.mounted(&h.staging()));
        let record = h.service.records().get("pvc-1").unwrap();
        assert_eq!(record.node_id, "node-a");
        assert_eq!(record.device_path, PathBuf::from(FakeHost::DEVICE));
        assert_eq!(record.fs_type(), Some(FsType::Ext4));
    }

    #[tokio::test]
    async fn test_stage_reuses_matching_filesystem() {
        let h = harness().await;
        h.host.set_device_fs(Some("ext4"));

        h.service
            .node_stage_volume(&CallContext::new(), stage_request(&h, mount_capability()))
            .await
            .unwrap();
        assert_eq!(h.host.formats(), 0);
    }

    #[tokio::test]
    async fn test_stage_never_reformats_foreign_filesystem() {
        let h = harness().await;
        h.host.set_device_fs(Some("xfs"));

        let err = h
            .service
            .node_stage_volume(&CallContext::new(), stage_request(&h, mount_capability()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(h.host.formats(), 0);
        assert_eq!(h.host.logouts(), 1);
        assert!(h.service.records().is_empty());
    }

    #[tokio::test]
    async fn test_failed_mount_logs_out() {
        let h = harness().await;
        h.host.fail_mount(true);

        let err = h
            .service
            .node_stage_volume(&CallContext::new(), stage_request(&h, mount_capability()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(h.host.logins(), 1);
        assert_eq!(h.host.logouts(), 1);
        assert!(h.service.records().is_empty());
    }

    #[tokio::test]
    async fn test_stage_past_deadline_rolls_back() {
        let h = harness().await;
        h.host.set_mount_delay(Duration::from_millis(250));

        let started = Instant::now();
        let err = h
            .service
            .node_stage_volume(
                &CallContext::with_timeout(Duration::from_millis(50)),
                stage_request(&h, mount_capability()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(h.host.logins(), 1);
        assert_eq!(h.host.logouts(), 1);
        assert!(!h.host.mounted(&h.staging()));
        assert!(h.service.records().is_empty());
    }

    #[tokio::test]
    async fn test_unstage_logs_out_after_dropped_stage() {
        let h = harness().await;
        h.host.set_mount_delay(Duration::from_millis(250));

        let ctx = CallContext::new();
        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(h.host.logins(), 1);
        let record = h.service.records().get("pvc-1").unwrap();
        assert!(record.is_pending());

        // Half-staged volumes cannot be published or expanded
        let err = h
            .service
            .node_publish_volume(&ctx, publish_request(&h, "a", mount_capability()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        h.service.node_unstage_volume(&ctx, unstage_request(&h)).await.unwrap();
        assert_eq!(h.host.logouts(), 1);
        assert!(h.service.records().is_empty());
    }

    #[tokio::test]
    async fn test_restage_completes_dropped_stage() {
        let h = harness().await;
        h.host.set_mount_delay(Duration::from_millis(250));
        let ctx = CallContext::new();
        let _ = tokio::time::timeout(
            Duration::from_millis(50),
            h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())),
        )
        .await;

        h.host.set_mount_delay(Duration::ZERO);
        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();
        let record = h.service.records().get("pvc-1").unwrap();
        assert!(!record.is_pending());
        assert_eq!(record.device_path, PathBuf::from(FakeHost::DEVICE));
        assert!(h.host.mounted(&h.staging()));
    }

    #[tokio::test]
    async fn test_stage_preconditions() {
        let h = harness().await;
        let ctx = CallContext::new();

        let mut missing = stage_request(&h, mount_capability());
        missing.volume_id = "nope".into();
        let err = h.service.node_stage_volume(&ctx, missing).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        add_volume(&h.store, "pvc-new", AccessType::default(), VolumePhase::Creating).await;
        let mut creating = stage_request(&h, mount_capability());
        creating.volume_id = "pvc-new".into();
        let err = h.service.node_stage_volume(&ctx, creating).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let mut no_capability = stage_request(&h, mount_capability());
        no_capability.volume_capability = None;
        let err = h.service.node_stage_volume(&ctx, no_capability).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        assert_eq!(h.host.logins(), 0);
    }

    #[tokio::test]
    async fn test_stage_at_second_path_is_rejected() {
        let h = harness().await;
        let ctx = CallContext::new();
        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();

        let mut elsewhere = stage_request(&h, mount_capability());
        elsewhere.staging_target_path = h.dir.path().join("other");
        let err = h.service.node_stage_volume(&ctx, elsewhere).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_publish_and_unstage_lifecycle() {
        let h = harness().await;
        let ctx = CallContext::new();

        let err = h
            .service
            .node_publish_volume(&ctx, publish_request(&h, "a", mount_capability()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();
        h.service
            .node_publish_volume(&ctx, publish_request(&h, "a", mount_capability()))
            .await
            .unwrap();
        h.service
            .node_publish_volume(&ctx, publish_request(&h, "a", mount_capability()))
            .await
            .unwrap();
        assert!(h.host.mounted(&h.target("a")));
        assert_eq!(h.service.records().get("pvc-1").unwrap().targets.len(), 1);

        // Bind mounts still hold the staging mount
        let err = h.service.node_unstage_volume(&ctx, unstage_request(&h)).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(h.host.logouts(), 0);

        let unpublish = NodeUnpublishVolumeRequest {
            volume_id: "pvc-1".into(),
            target_path: h.target("a"),
        };
        h.service.node_unpublish_volume(&ctx, unpublish.clone()).await.unwrap();
        h.service.node_unpublish_volume(&ctx, unpublish).await.unwrap();
        assert!(!h.host.mounted(&h.target("a")));
        assert!(!h.target("a").exists());

        h.service.node_unstage_volume(&ctx, unstage_request(&h)).await.unwrap();
        h.service.node_unstage_volume(&ctx, unstage_request(&h)).await.unwrap();
        assert_eq!(h.host.logouts(), 1);
        assert!(!h.host.mounted(&h.staging()));
        assert!(h.service.records().is_empty());
    }

    #[tokio::test]
    async fn test_publish_with_wrong_staging_path() {
        let h = harness().await;
        let ctx = CallContext::new();
        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();

        let mut req = publish_request(&h, "a", mount_capability());
        req.staging_target_path = h.dir.path().join("elsewhere");
        let err = h.service.node_publish_volume(&ctx, req).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_block_volume_publishes_device() {
        let h = harness().await;
        add_volume(&h.store, "pvc-block", AccessType::Block, VolumePhase::Published).await;
        let ctx = CallContext::new();

        let mut stage = stage_request(&h, block_capability());
        stage.volume_id = "pvc-block".into();
        h.service.node_stage_volume(&ctx, stage).await.unwrap();
        assert_eq!(h.host.formats(), 0);
        assert!(!h.host.mounted(&h.staging()));

        let mut publish = publish_request(&h, "b", block_capability());
        publish.volume_id = "pvc-block".into();
        h.service.node_publish_volume(&ctx, publish).await.unwrap();
        assert!(h.target("b").is_file());
        assert!(h.host.mounted(&h.target("b")));
    }

    #[tokio::test]
    async fn test_expand_before_controller_grow_fails() {
        let h = harness().await;
        let ctx = CallContext::new();
        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();

        let req = NodeExpandVolumeRequest {
            volume_id: "pvc-1".into(),
            volume_path: h.staging(),
            capacity_range: Some(CapacityRange::required(2 * GIB)),
        };
        let err = h.service.node_expand_volume(&ctx, req.clone()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(h.host.grows(), 0);

        // Controller finished, but the device has not caught up yet
        modify_status(h.store.as_ref(), "pvc-1", |v| {
            v.status_mut().capacity_bytes = 2 * GIB;
            Ok(())
        })
        .await
        .unwrap();
        h.host.set_device_size(GIB);
        let err = h.service.node_expand_volume(&ctx, req.clone()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(h.host.rescans(), 1);

        h.host.set_device_size(2 * GIB);
        let resp = h.service.node_expand_volume(&ctx, req).await.unwrap();
        assert_eq!(resp.capacity_bytes, 2 * GIB);
        assert_eq!(h.host.grows(), 1);
    }

    #[tokio::test]
    async fn test_expand_while_resizing_or_unstaged() {
        let h = harness().await;
        let ctx = CallContext::new();
        let req = NodeExpandVolumeRequest {
            volume_id: "pvc-1".into(),
            volume_path: h.staging(),
            capacity_range: None,
        };

        let err = h.service.node_expand_volume(&ctx, req.clone()).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        h.service.node_stage_volume(&ctx, stage_request(&h, mount_capability())).await.unwrap();
        modify_status(h.store.as_ref(), "pvc-1", |v| v.transition(VolumePhase::Resizing, None))
            .await
            .unwrap();
        let err = h.service.node_expand_volume(&ctx, req).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_expand_block_volume_skips_filesystem() {
        let h = harness().await;
        add_volume(&h.store, "pvc-block", AccessType::Block, VolumePhase::Published).await;
        let ctx = CallContext::new();
        let mut stage = stage_request(&h, block_capability());
        stage.volume_id = "pvc-block".into();
        h.service.node_stage_volume(&ctx, stage).await.unwrap();
        h.host.set_device_size(GIB);

        let resp = h
            .service
            .node_expand_volume(
                &ctx,
                NodeExpandVolumeRequest {
                    volume_id: "pvc-block".into(),
                    volume_path: h.staging(),
                    capacity_range: Some(CapacityRange::required(GIB)),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.capacity_bytes, GIB);
        assert_eq!(h.host.grows(), 0);
    }

    #[tokio::test]
    async fn test_node_info() {
        let h = harness().await;
        let info = h.service.node_get_info();
        assert_eq!(info.node_id, "node-a");
        assert_eq!(info.max_volumes_per_node, 0);
        assert!(h
            .service
            .node_get_capabilities()
            .capabilities
            .contains(&NodeCapability::ExpandVolume));
    }
}
