//! iSCSI session management through `iscsiadm`

use super::{command_line, failure_reason, run, run_raw, HostConfig};
use crate::domain::ports::IscsiTarget;
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// `iscsiadm` exit status when a session to the target already exists
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// `iscsiadm` exit status when no session or record matches
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// udev path of the LUN once the session is up
pub fn device_path(target: &IscsiTarget) -> PathBuf {
    PathBuf::from(format!(
        "/dev/disk/by-path/ip-{}-iscsi-{}-lun-{}",
        target.portal, target.iqn, target.lun
    ))
}

fn iscsi_error(operation: &str, target: &IscsiTarget, reason: impl std::fmt::Display) -> Error {
    Error::Iscsi {
        operation: operation.to_string(),
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

async fn login_once(target: &IscsiTarget, device_wait: Duration) -> Result<PathBuf> {
    run(
        "iscsiadm",
        &["-m", "discovery", "-t", "sendtargets", "-p", target.portal.as_str()],
    )
    .await
    .map_err(|e| iscsi_error("discovery", target, e))?;

    let args = ["-m", "node", "-T", target.iqn.as_str(), "-p", target.portal.as_str(), "--login"];
    let output = run_raw("iscsiadm", &args).await?;
    match output.status.code() {
        Some(0) => {}
        Some(ISCSI_ERR_SESS_EXISTS) => debug!("session already established"),
        _ => {
            return Err(iscsi_error(
                "login",
                target,
                format!("{}: {}", command_line("iscsiadm", &args), failure_reason(&output)),
            ))
        }
    }

    let device = device_path(target);
    let deadline = Instant::now() + device_wait;
    loop {
        if tokio::fs::metadata(&device).await.is_ok() {
            return Ok(device);
        }
        if Instant::now() >= deadline {
            return Err(iscsi_error(
                "login",
                target,
                format!("device {} did not appear", device.display()),
            ));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Log in to `target`, retrying with backoff, and return its block device
pub async fn login(target: &IscsiTarget, config: &HostConfig) -> Result<PathBuf> {
    let attempts = AtomicU32::new(0);
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.login_retry)
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(None)
        .build();

    let device = backoff::future::retry_notify(
        policy,
        || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            login_once(target, config.device_wait).await.map_err(|e| {
                if attempt >= config.login_attempts {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        },
        |e: Error, wait: Duration| {
            warn!(error = %e, retry_in_ms = wait.as_millis() as u64, "iSCSI login failed, retrying");
        },
    )
    .await?;

    info!(device = %device.display(), "iSCSI session established");
    Ok(device)
}

/// Close the session and forget the node record
pub async fn logout(target: &IscsiTarget) -> Result<()> {
    let args = ["-m", "node", "-T", target.iqn.as_str(), "-p", target.portal.as_str(), "--logout"];
    let output = run_raw("iscsiadm", &args).await?;
    match output.status.code() {
        Some(0) => info!("iSCSI session closed"),
        Some(ISCSI_ERR_NO_OBJS_FOUND) => debug!("no iSCSI session to close"),
        _ => return Err(iscsi_error("logout", target, failure_reason(&output))),
    }

    let delete = ["-m", "node", "-T", target.iqn.as_str(), "-p", target.portal.as_str(), "-o", "delete"];
    if let Err(e) = run("iscsiadm", &delete).await {
        debug!(error = %e, "node record not deleted");
    }
    Ok(())
}

/// Make the initiator re-read the LUN, picking up a grown size
pub async fn rescan(target: &IscsiTarget) -> Result<()> {
    run(
        "iscsiadm",
        &["-m", "node", "-T", target.iqn.as_str(), "-p", target.portal.as_str(), "-R"],
    )
    .await
    .map_err(|e| iscsi_error("rescan", target, e))?;
    Ok(())
}
