//! Interrupt handling and one-shot cleanup.
//!
//! Signals never run cleanup themselves. A listener task turns SIGINT and
//! SIGTERM into a [`CancellationToken`] that the watch loop checks at every
//! boundary (and races against its sleep). Whoever reaches
//! [`InterruptGuard::cleanup`] first cancels the outstanding jobs; every
//! later call is a no-op, however many signals arrive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::JobDispatcher;
use crate::lab::LabClient;
use crate::model::JobId;

/// Interrupt flag plus the idempotent cleanup it guards.
#[derive(Clone, Default)]
pub struct InterruptGuard {
    token: CancellationToken,
    cleanup_done: Arc<AtomicBool>,
}

impl InterruptGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when an interrupt arrives.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Records an interrupt. Safe to call any number of times.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cleanup_done(&self) -> bool {
        self.cleanup_done.load(Ordering::SeqCst)
    }

    /// Spawns a task forwarding SIGINT/SIGTERM to [`trigger`](Self::trigger).
    ///
    /// The task keeps listening after the first signal so repeated signals
    /// are absorbed instead of killing the process mid-cleanup.
    pub fn install(&self) -> std::io::Result<JoinHandle<()>> {
        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let guard = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                #[cfg(unix)]
                let received = tokio::select! {
                    r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
                    _ = sigterm.recv() => Ok("SIGTERM"),
                };
                #[cfg(not(unix))]
                let received = tokio::signal::ctrl_c().await.map(|_| "Ctrl+C");

                match received {
                    Ok(name) => {
                        if guard.is_interrupted() {
                            info!("Received {} again, cleanup already requested", name);
                        } else {
                            warn!("Received {}, cancelling outstanding jobs", name);
                        }
                        guard.trigger();
                    }
                    Err(e) => {
                        warn!("Signal listener failed: {}", e);
                        return;
                    }
                }
            }
        }))
    }

    /// Cancels `jobs` exactly once per guard.
    ///
    /// Returns `true` if this call performed the cleanup, `false` if an
    /// earlier call already did.
    pub async fn cleanup<C: LabClient>(
        &self,
        dispatcher: &JobDispatcher<C>,
        jobs: &[JobId],
    ) -> bool {
        if self
            .cleanup_done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        info!("Cleaning up {} outstanding job(s)", jobs.len());
        for job in jobs {
            dispatcher.cancel(job).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::fake::FakeLab;

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let guard = InterruptGuard::new();
        let dispatcher = JobDispatcher::new(FakeLab::new());
        let jobs = vec![JobId::from_number("1"), JobId::from_number("2")];

        guard.trigger();
        assert!(guard.cleanup(&dispatcher, &jobs).await);
        guard.trigger();
        assert!(!guard.cleanup(&dispatcher, &jobs).await);

        assert!(guard.cleanup_done());
        assert_eq!(dispatcher.client().cancelled(), jobs);
    }

    #[tokio::test]
    async fn test_cleanup_shared_between_clones() {
        let guard = InterruptGuard::new();
        let other = guard.clone();
        let dispatcher = JobDispatcher::new(FakeLab::new());
        let jobs = vec![JobId::from_number("7")];

        assert!(other.cleanup(&dispatcher, &jobs).await);
        assert!(!guard.cleanup(&dispatcher, &jobs).await);
        assert_eq!(dispatcher.client().cancelled().len(), 1);
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let guard = InterruptGuard::new();
        assert!(!guard.is_interrupted());
        guard.trigger();
        guard.trigger();
        assert!(guard.is_interrupted());
        assert!(!guard.cleanup_done());
    }
}
