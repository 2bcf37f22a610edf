//! Quorum Reconciler
//!
//! Bridges the backend's eventually consistent replica state and the
//! synchronous controller RPCs. After a provision or resize request the
//! backend converges on its own; the reconciler polls the volume's
//! controller at a fixed interval until a replica quorum is reported (at a
//! minimum size, for resizes), the deadline passes, or the caller cancels.
//!
//! The reconciler only observes. It never writes the volume resource.

use crate::crd::BackendEndpoint;
use crate::domain::ports::{BackendControlRef, ReplicaStatusSnapshot};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Policy
// =============================================================================

/// How many healthy replicas make a quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuorumPolicy {
    /// More than half of the desired replica count
    Majority,
    /// A fixed number of replicas, capped at the desired count
    AtLeast(u32),
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::Majority
    }
}

impl QuorumPolicy {
    /// Healthy replicas required out of `desired`
    pub fn required(&self, desired: u32) -> u32 {
        match self {
            QuorumPolicy::Majority => desired / 2 + 1,
            QuorumPolicy::AtLeast(k) => (*k).clamp(1, desired.max(1)),
        }
    }
}

impl FromStr for QuorumPolicy {
    type Err = Error;

    /// `majority` or a replica count such as `2`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("majority") {
            return Ok(QuorumPolicy::Majority);
        }
        match s.parse::<u32>() {
            Ok(k) if k > 0 => Ok(QuorumPolicy::AtLeast(k)),
            _ => Err(Error::Configuration(format!(
                "quorum policy must be 'majority' or a positive count, got '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumPolicy::Majority => write!(f, "majority"),
            QuorumPolicy::AtLeast(k) => write!(f, "at-least-{}", k),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Reconciler tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    /// Time between two status fetches, in milliseconds
    pub poll_interval_ms: u64,
    /// Consecutive failed fetches tolerated before giving up
    pub max_fetch_failures: u32,
    pub policy: QuorumPolicy,
}

impl ReconcilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_fetch_failures: 5,
            policy: QuorumPolicy::Majority,
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// What the reconciler waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumTarget {
    /// Desired replica count of the volume
    pub desired_replicas: u32,
    /// Every counted replica and the controller must report at least this
    /// many bytes
    pub min_size_bytes: Option<u64>,
}

impl QuorumTarget {
    pub fn replicas(desired_replicas: u32) -> Self {
        Self {
            desired_replicas,
            min_size_bytes: None,
        }
    }

    pub fn at_size(desired_replicas: u32, size_bytes: u64) -> Self {
        Self {
            desired_replicas,
            min_size_bytes: Some(size_bytes),
        }
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready(ReplicaStatusSnapshot),
    /// The deadline passed; carries the last snapshot seen, if any
    TimedOut(Option<ReplicaStatusSnapshot>),
    Cancelled,
}

/// Polls a volume's controller until quorum
#[derive(Clone)]
pub struct QuorumReconciler {
    backend: BackendControlRef,
    config: ReconcilerConfig,
}

impl QuorumReconciler {
    pub fn new(backend: BackendControlRef, config: ReconcilerConfig) -> Self {
        Self { backend, config }
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.config.policy
    }

    /// Whether `snapshot` satisfies `target` under the configured policy
    pub fn is_satisfied(&self, snapshot: &ReplicaStatusSnapshot, target: &QuorumTarget) -> bool {
        let required = self.config.policy.required(target.desired_replicas);
        if !snapshot.controller_quorum {
            return false;
        }
        match target.min_size_bytes {
            None => snapshot.healthy_count() >= required,
            Some(size) => {
                snapshot.controller_size_bytes >= size && snapshot.healthy_at_size(size) >= required
            }
        }
    }

    /// Poll until `target` is met, `deadline` passes or `cancel` fires.
    ///
    /// Fetch failures are tolerated up to `max_fetch_failures` in a row,
    /// after which the last one is surfaced as `BackendUnavailable`.
    pub async fn wait_for_quorum(
        &self,
        volume: &str,
        endpoint: &BackendEndpoint,
        target: QuorumTarget,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last: Option<ReplicaStatusSnapshot> = None;
        let mut failures = 0u32;
        let started = Instant::now();

        loop {
            // The fetch races the deadline too; a slow controller is
            // abandoned mid-request
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(volume, "quorum wait cancelled");
                    return Ok(Outcome::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        volume,
                        waited_ms = started.elapsed().as_millis() as u64,
                        healthy = last.as_ref().map(|s| s.healthy_count()),
                        "quorum wait timed out"
                    );
                    return Ok(Outcome::TimedOut(last));
                }
                fetched = async {
                    ticker.tick().await;
                    self.backend.replica_status(endpoint).await
                } => fetched,
            };

            match fetched {
                Ok(snapshot) => {
                    failures = 0;
                    if self.is_satisfied(&snapshot, &target) {
                        info!(
                            volume,
                            healthy = snapshot.healthy_count(),
                            desired = target.desired_replicas,
                            policy = %self.config.policy,
                            "replica quorum reached"
                        );
                        return Ok(Outcome::Ready(snapshot));
                    }
                    debug!(
                        volume,
                        healthy = snapshot.healthy_count(),
                        controller_quorum = snapshot.controller_quorum,
                        "waiting for replica quorum"
                    );
                    last = Some(snapshot);
                }
                Err(e) => {
                    failures += 1;
                    warn!(volume, failures, error = %e, "replica status fetch failed");
                    if failures >= self.config.max_fetch_failures {
                        return Err(Error::BackendUnavailable(format!(
                            "replica status of {} unavailable after {} attempts: {}",
                            volume, failures, e
                        )));
                    }
                }
            }
        }
    }
}
