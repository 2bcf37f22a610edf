//! Identity, Controller and Node services
//!
//! Transport-independent implementations of the container-storage RPC
//! methods. Each method takes a [`CallContext`] carrying the caller's
//! deadline and a cancellation token, validates its request, takes the
//! per-volume lock and then drives the store, backend and host ports.

pub mod controller;
pub mod identity;
pub mod node;
pub mod types;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call deadline and cancellation
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Point in time after which the caller stops waiting
    pub deadline: Option<Instant>,
    /// Fires when the caller or the server gives up on the call
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The earlier of the call deadline and `bound` from now
    pub fn deadline_within(&self, bound: Duration) -> Instant {
        let bounded = Instant::now() + bound;
        match self.deadline {
            Some(deadline) => deadline.min(bounded),
            None => bounded,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` until it completes, the call deadline passes or the call
    /// is cancelled. On deadline or cancellation `fut` is dropped and
    /// whatever it was doing is abandoned.
    pub async fn run<T, F>(&self, volume_id: &str, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled {
                volume_id: volume_id.to_string(),
            }),
            _ = expired => Err(Error::DeadlineExceeded {
                what: format!("{} of volume {}", what, volume_id),
                elapsed: started.elapsed(),
            }),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_within_takes_earlier() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let bounded = ctx.deadline_within(Duration::from_secs(60));
        assert!(bounded <= Instant::now() + Duration::from_secs(1));

        let open = CallContext::new();
        let bounded = open.deadline_within(Duration::from_millis(10));
        assert!(bounded <= Instant::now() + Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_run_abandons_work_past_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let started = Instant::now();
        let err = ctx
            .run("pvc-1", "login", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let ctx = CallContext::new();
        ctx.cancel.cancel();
        let err = ctx
            .run("pvc-1", "resize", async { Ok(1u64) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));

        let open = CallContext::new();
        assert_eq!(open.run("pvc-1", "resize", async { Ok(7u64) }).await.unwrap(), 7);
    }
}
