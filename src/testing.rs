//! Test doubles for the backend and host ports

use crate::crd::{BackendEndpoint, FsType};
use crate::domain::ports::{
    BackendControl, HostOps, IscsiTarget, ProvisionRequest, ReplicaHealth, ReplicaStatus,
    ReplicaStatusSnapshot,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// Backend
// =============================================================================

/// Scriptable backend.
///
/// Replica status comes from queued snapshots (the last one repeats); with
/// nothing queued it reports `replicas` healthy replicas at the size set by
/// the last provision or resize.
#[derive(Debug)]
pub struct FakeBackend {
    provisions: AtomicUsize,
    teardowns: AtomicUsize,
    status_calls: AtomicUsize,
    resizes: Mutex<Vec<(String, u64)>>,
    snapshots: Mutex<VecDeque<ReplicaStatusSnapshot>>,
    replicas: AtomicUsize,
    size: AtomicU64,
    never_ready: AtomicBool,
    fail_status: AtomicBool,
    exhausted: AtomicBool,
    refuse_teardown: AtomicBool,
    provision_delay: Mutex<Duration>,
    status_delay: Mutex<Duration>,
    resize_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            provisions: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            resizes: Mutex::new(Vec::new()),
            snapshots: Mutex::new(VecDeque::new()),
            replicas: AtomicUsize::new(3),
            size: AtomicU64::new(0),
            never_ready: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            refuse_teardown: AtomicBool::new(false),
            provision_delay: Mutex::new(Duration::ZERO),
            status_delay: Mutex::new(Duration::ZERO),
            resize_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn endpoint(name: &str) -> BackendEndpoint {
        BackendEndpoint {
            controller_api: format!("http://{}-ctrl:9501", name),
            target_portal: "10.0.0.5:3260".into(),
            iqn: format!("iqn.2016-09.com.openebs.jiva:{}", name),
            lun: 0,
        }
    }

    pub fn push_snapshot(&self, snapshot: ReplicaStatusSnapshot) {
        self.snapshots.lock().push_back(snapshot);
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn resizes(&self) -> Vec<(String, u64)> {
        self.resizes.lock().clone()
    }

    pub fn set_never_ready(&self, value: bool) {
        self.never_ready.store(value, Ordering::SeqCst);
    }

    pub fn fail_status(&self, value: bool) {
        self.fail_status.store(value, Ordering::SeqCst);
    }

    pub fn set_exhausted(&self, value: bool) {
        self.exhausted.store(value, Ordering::SeqCst);
    }

    pub fn refuse_teardown(&self, value: bool) {
        self.refuse_teardown.store(value, Ordering::SeqCst);
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        *self.provision_delay.lock() = delay;
    }

    pub fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock() = delay;
    }

    pub fn set_resize_delay(&self, delay: Duration) {
        *self.resize_delay.lock() = delay;
    }

    fn generated_snapshot(&self) -> ReplicaStatusSnapshot {
        let health = if self.never_ready.load(Ordering::SeqCst) {
            ReplicaHealth::Degraded
        } else {
            ReplicaHealth::Healthy
        };
        let size = self.size.load(Ordering::SeqCst);
        ReplicaStatusSnapshot {
            replicas: (0..self.replicas.load(Ordering::SeqCst))
                .map(|i| ReplicaStatus {
                    address: format!("tcp://10.0.1.{}:9502", i + 1),
                    health,
                    size_bytes: size,
                })
                .collect(),
            controller_quorum: health == ReplicaHealth::Healthy,
            controller_size_bytes: size,
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendControl for FakeBackend {
    async fn provision(&self, request: &ProvisionRequest) -> Result<BackendEndpoint> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        let delay = *self.provision_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(Error::ResourceExhausted(format!(
                "no pool can hold {} bytes",
                request.capacity_bytes
            )));
        }
        self.size.store(request.capacity_bytes, Ordering::SeqCst);
        self.replicas
            .store(request.replica_count as usize, Ordering::SeqCst);
        Ok(Self::endpoint(&request.name))
    }

    async fn teardown(&self, name: &str) -> Result<()> {
        if self.refuse_teardown.load(Ordering::SeqCst) {
            return Err(Error::DetachRefused {
                volume_id: name.to_string(),
                reason: "target has connected initiators".into(),
            });
        }
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replica_status(&self, _endpoint: &BackendEndpoint) -> Result<ReplicaStatusSnapshot> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.status_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("connection refused".into()));
        }
        let mut queue = self.snapshots.lock();
        match queue.len() {
            0 => Ok(self.generated_snapshot()),
            1 => Ok(queue[0].clone()),
            _ => Ok(queue.pop_front().unwrap_or_default()),
        }
    }

    async fn resize(&self, _endpoint: &BackendEndpoint, name: &str, size_bytes: u64) -> Result<()> {
        self.resizes.lock().push((name.to_string(), size_bytes));
        let delay = *self.resize_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.size.store(size_bytes, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend_name(&self) -> &str {
        "fake"
    }
}

// =============================================================================
// Host
// =============================================================================

/// Host double that tracks sessions, filesystems and mounts in memory
#[derive(Debug)]
pub struct FakeHost {
    logins: AtomicUsize,
    logouts: AtomicUsize,
    formats: AtomicUsize,
    rescans: AtomicUsize,
    grows: AtomicUsize,
    device_fs: Mutex<Option<String>>,
    device_size: AtomicU64,
    mounts: Mutex<HashSet<PathBuf>>,
    fail_mount: AtomicBool,
    mount_delay: Mutex<Duration>,
}

impl FakeHost {
    pub const DEVICE: &'static str = "/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-lun-0";

    pub fn new() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            formats: AtomicUsize::new(0),
            rescans: AtomicUsize::new(0),
            grows: AtomicUsize::new(0),
            device_fs: Mutex::new(None),
            device_size: AtomicU64::new(0),
            mounts: Mutex::new(HashSet::new()),
            fail_mount: AtomicBool::new(false),
            mount_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn formats(&self) -> usize {
        self.formats.load(Ordering::SeqCst)
    }

    pub fn rescans(&self) -> usize {
        self.rescans.load(Ordering::SeqCst)
    }

    pub fn grows(&self) -> usize {
        self.grows.load(Ordering::SeqCst)
    }

    pub fn set_device_fs(&self, fs: Option<&str>) {
        *self.device_fs.lock() = fs.map(str::to_string);
    }

    pub fn set_device_size(&self, size: u64) {
        self.device_size.store(size, Ordering::SeqCst);
    }

    pub fn fail_mount(&self, value: bool) {
        self.fail_mount.store(value, Ordering::SeqCst);
    }

    pub fn set_mount_delay(&self, delay: Duration) {
        *self.mount_delay.lock() = delay;
    }

    pub fn mounted(&self, path: &Path) -> bool {
        self.mounts.lock().contains(path)
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn login(&self, _target: &IscsiTarget) -> Result<PathBuf> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from(Self::DEVICE))
    }

    async fn logout(&self, _target: &IscsiTarget) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rescan(&self, _target: &IscsiTarget) -> Result<()> {
        self.rescans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe_fs(&self, _device: &Path) -> Result<Option<String>> {
        Ok(self.device_fs.lock().clone())
    }

    async fn format(&self, _device: &Path, fs_type: FsType) -> Result<()> {
        self.formats.fetch_add(1, Ordering::SeqCst);
        *self.device_fs.lock() = Some(fs_type.to_string());
        Ok(())
    }

    async fn device_size(&self, _device: &Path) -> Result<u64> {
        Ok(self.device_size.load(Ordering::SeqCst))
    }

    async fn grow_fs(&self, _device: &Path, _mount_path: &Path, _fs_type: FsType) -> Result<()> {
        self.grows.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn mount(&self, _device: &Path, target: &Path, _fs_type: FsType, _flags: &[String]) -> Result<()> {
        let delay = *self.mount_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(Error::Mount {
                path: target.display().to_string(),
                reason: "wrong fs type, bad superblock".into(),
            });
        }
        self.mounts.lock().insert(target.to_path_buf());
        Ok(())
    }

    async fn bind_mount(&self, _source: &Path, target: &Path, _read_only: bool) -> Result<()> {
        self.mounts.lock().insert(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.mounts.lock().remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounts.lock().contains(target))
    }
}
