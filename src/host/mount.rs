//! Filesystems and the mount table

use super::{failure_reason, run, run_raw};
use crate::crd::FsType;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// `blkid` exit status when the device carries no recognizable signature
const BLKID_NOTHING_FOUND: i32 = 2;

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Undo the octal escapes the kernel applies to whitespace and backslashes
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|code| u8::from_str_radix(code, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/self/mounts` content, skipping malformed lines
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
                fs_type: fs_type.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

pub async fn is_mounted(target: &Path) -> Result<bool> {
    let contents = tokio::fs::read_to_string(MOUNT_TABLE).await?;
    Ok(parse_mount_table(&contents)
        .iter()
        .any(|entry| entry.target == target))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

pub async fn probe_fs(device: &Path) -> Result<Option<String>> {
    let device = display(device);
    let output = run_raw("blkid", &["-p", "-s", "TYPE", "-o", "value", device.as_str()]).await?;
    match output.status.code() {
        Some(0) => {
            let fs = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(if fs.is_empty() { None } else { Some(fs) })
        }
        Some(BLKID_NOTHING_FOUND) => Ok(None),
        _ => Err(Error::command(format!("blkid {}", device), failure_reason(&output))),
    }
}

pub async fn format(device: &Path, fs_type: FsType) -> Result<()> {
    let device_str = display(device);
    let result = match fs_type {
        FsType::Ext4 => run("mkfs.ext4", &["-F", "-m0", device_str.as_str()]).await,
        FsType::Xfs => run("mkfs.xfs", &["-f", device_str.as_str()]).await,
    };
    result.map_err(|e| Error::Format {
        device: device_str.clone(),
        fs_type: fs_type.to_string(),
        reason: e.to_string(),
    })?;
    info!(device = %device_str, fs = %fs_type, "device formatted");
    Ok(())
}

pub async fn device_size(device: &Path) -> Result<u64> {
    let device = display(device);
    let out = run("blockdev", &["--getsize64", device.as_str()]).await?;
    out.trim()
        .parse()
        .map_err(|e| Error::command(format!("blockdev --getsize64 {}", device), e))
}

pub async fn grow_fs(device: &Path, mount_path: &Path, fs_type: FsType) -> Result<()> {
    match fs_type {
        FsType::Ext4 => run("resize2fs", &[display(device).as_str()]).await?,
        FsType::Xfs => run("xfs_growfs", &[display(mount_path).as_str()]).await?,
    };
    info!(device = %device.display(), fs = %fs_type, "filesystem grown");
    Ok(())
}

fn mount_error(target: &Path, e: Error) -> Error {
    Error::Mount {
        path: display(target),
        reason: e.to_string(),
    }
}

pub async fn mount(device: &Path, target: &Path, fs_type: FsType, flags: &[String]) -> Result<()> {
    let fs = fs_type.to_string();
    let device_str = display(device);
    let target_str = display(target);
    let options = flags.join(",");

    let mut args = vec!["-t", fs.as_str()];
    if !options.is_empty() {
        args.extend(["-o", options.as_str()]);
    }
    args.extend([device_str.as_str(), target_str.as_str()]);

    run("mount", &args).await.map_err(|e| mount_error(target, e))?;
    info!(device = %device_str, target = %target_str, fs = %fs, "filesystem mounted");
    Ok(())
}

pub async fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    let source_str = display(source);
    let target_str = display(target);
    run("mount", &["--bind", source_str.as_str(), target_str.as_str()])
        .await
        .map_err(|e| mount_error(target, e))?;

    // MS_RDONLY is ignored on the initial bind, so remount
    if read_only {
        run("mount", &["-o", "remount,bind,ro", target_str.as_str()])
            .await
            .map_err(|e| mount_error(target, e))?;
    }
    info!(source = %source_str, target = %target_str, read_only, "bind mount created");
    Ok(())
}

pub async fn unmount(target: &Path) -> Result<()> {
    if !is_mounted(target).await? {
        debug!(target = %target.display(), "not mounted, nothing to unmount");
        return Ok(());
    }
    run("umount", &[display(target).as_str()])
        .await
        .map_err(|e| Error::Unmount {
            path: display(target),
            reason: e.to_string(),
        })?;
    info!(target = %target.display(), "unmounted");
    Ok(())
}
