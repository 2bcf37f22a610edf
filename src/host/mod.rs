//! Device & Mount Manager
//!
//! Host-side half of the node service: iSCSI sessions, filesystem probe,
//! format and grow, and the mount table. [`LinuxHost`] shells out to the
//! standard tools (`iscsiadm`, `blkid`, `mkfs.*`, `mount`, ...), which must
//! be on `PATH` of the node plugin container.

pub mod iscsi;
pub mod mount;

use crate::crd::FsType;
use crate::domain::ports::{HostOps, IscsiTarget};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Tuning for host operations
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// iSCSI login attempts before giving up
    pub login_attempts: u32,
    /// Delay before the first login retry
    pub login_retry: Duration,
    /// How long to wait for the block device to appear after login
    pub device_wait: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            login_attempts: 5,
            login_retry: Duration::from_millis(500),
            device_wait: Duration::from_secs(10),
        }
    }
}

/// [`HostOps`] on a Linux node
#[derive(Debug, Clone, Default)]
pub struct LinuxHost {
    config: HostConfig,
}

impl LinuxHost {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

/// Run a command and return its output, whatever the exit status
pub(crate) async fn run_raw(program: &str, args: &[&str]) -> Result<Output> {
    debug!(program, ?args, "running host command");
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::command(command_line(program, args), e))
}

/// Run a command and fail unless it exits with status 0
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = run_raw(program, args).await?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    Err(Error::command(command_line(program, args), failure_reason(&output)))
}

pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    match output.status.code() {
        Some(code) => format!("exit status {}: {}", code, stderr.trim()),
        None => format!("terminated by signal: {}", stderr.trim()),
    }
}

#[async_trait]
impl HostOps for LinuxHost {
    #[instrument(skip(self), fields(target = %target))]
    async fn login(&self, target: &IscsiTarget) -> Result<PathBuf> {
        iscsi::login(target, &self.config).await
    }

    #[instrument(skip(self), fields(target = %target))]
    async fn logout(&self, target: &IscsiTarget) -> Result<()> {
        iscsi::logout(target).await
    }

    async fn rescan(&self, target: &IscsiTarget) -> Result<()> {
        iscsi::rescan(target).await
    }

    async fn probe_fs(&self, device: &Path) -> Result<Option<String>> {
        mount::probe_fs(device).await
    }

    #[instrument(skip(self))]
    async fn format(&self, device: &Path, fs_type: FsType) -> Result<()> {
        mount::format(device, fs_type).await
    }

    async fn device_size(&self, device: &Path) -> Result<u64> {
        mount::device_size(device).await
    }

    #[instrument(skip(self))]
    async fn grow_fs(&self, device: &Path, mount_path: &Path, fs_type: FsType) -> Result<()> {
        mount::grow_fs(device, mount_path, fs_type).await
    }

    async fn mount(&self, device: &Path, target: &Path, fs_type: FsType, flags: &[String]) -> Result<()> {
        mount::mount(device, target, fs_type, flags).await
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        mount::bind_mount(source, target, read_only).await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        mount::unmount(target).await
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        mount::is_mounted(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("iscsiadm", &["-m", "node", "--login"]),
            "iscsiadm -m node --login"
        );
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let err = run("sh", &["-c", "echo nope >&2; exit 3"]).await.unwrap_err();
        assert_matches!(err, Error::Command { reason, .. } if reason.contains("exit status 3") && reason.contains("nope"));

        let out = run("sh", &["-c", "echo ok"]).await.unwrap();
        assert_eq!(out.trim(), "ok");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run("definitely-not-a-real-binary", &[]).await.unwrap_err();
        assert_matches!(err, Error::Command { .. });
    }
}
