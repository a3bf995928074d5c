//! The worker loop and its lifecycle handle.
//!
//! A worker serves one attempt at a time: claim, judge, heartbeat, sleep
//! when the queue is empty. Restart and shutdown requests arrive from the
//! signal task through a shared [`Lifecycle`] handle and are observed
//! between attempts, never in the middle of one.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::judge::{self, FatalError, JudgeEnv, JudgeError};
use crate::store::{AttemptStore, HeartbeatId, PgStore, ResultUpdate, StoreError};
use crate::toolchain::Toolchains;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FatalError> for WorkerError {
    fn from(e: FatalError) -> WorkerError {
        match e {
            FatalError::Store(e) => WorkerError::Store(e),
            FatalError::Io(e) => WorkerError::Io(e),
        }
    }
}

/// Process-scoped restart and shutdown state, shared between the signal
/// task, the outer restart loop and the inner worker loop.
#[derive(Clone, Default)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    restart: AtomicBool,
    terminate: AtomicBool,
    wake: Notify,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle::default()
    }

    /// Requests a soft restart: finish the current attempt, then reload
    /// the config and reconnect.
    pub fn request_restart(&self) {
        self.inner.restart.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Requests a shutdown: finish the current attempt, then exit.
    /// Returns `false` when a shutdown was already in progress.
    pub fn request_shutdown(&self) -> bool {
        let first = !self.inner.terminate.swap(true, Ordering::SeqCst);
        self.inner.restart.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        first
    }

    /// A restart (or shutdown, which implies one) is pending.
    pub fn restart_pending(&self) -> bool {
        self.inner.restart.load(Ordering::SeqCst)
    }

    pub fn terminating(&self) -> bool {
        self.inner.terminate.load(Ordering::SeqCst)
    }

    /// Rearms the restart flag; called at the top of the outer loop.
    pub fn clear_restart(&self) {
        self.inner.restart.store(false, Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early when a restart or shutdown is
    /// requested.
    pub async fn idle(&self, duration: Duration) {
        if self.restart_pending() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.inner.wake.notified() => {}
        }
    }
}

/// Connects to the queue and serves attempts until a restart or shutdown
/// is requested, or a fatal error occurs.
pub async fn run(
    config: &Config,
    toolchains: &Toolchains,
    cwd: &Path,
    name: &str,
    lifecycle: &Lifecycle,
) -> Result<(), WorkerError> {
    info!("started in {}", cwd.display());
    info!("compilers: {}", toolchains.compilers.keys().join(", "));
    info!("runners: {}", toolchains.runners.keys().join(", "));

    let mut store = PgStore::connect(&config.db.locator).await?;
    let heartbeat = store.register_worker().await?;
    let result = serve(&mut store, heartbeat, config, toolchains, cwd, name, lifecycle).await;
    if let Err(e) = store.unregister(heartbeat).await {
        warn!("failed to unregister heartbeat {heartbeat}: {e}");
    }
    store.close().await;
    result
}

async fn serve<S: AttemptStore>(
    store: &mut S,
    heartbeat: HeartbeatId,
    config: &Config,
    toolchains: &Toolchains,
    cwd: &Path,
    name: &str,
    lifecycle: &Lifecycle,
) -> Result<(), WorkerError> {
    let files = config.files.resolve(cwd);
    let env = JudgeEnv {
        toolchains,
        behaviour: &config.behaviour,
        problems_dir: &config.dirs.problems,
        files: &files,
        cwd,
    };
    let compilers: Vec<String> = toolchains.compilers.keys().cloned().collect();
    let runners: Vec<String> = toolchains.runners.keys().cloned().collect();
    let interval = Duration::from_secs_f64(config.behaviour.interval);

    while !lifecycle.restart_pending() {
        match store.claim_next(name, "Queued", &compilers, &runners).await? {
            None => lifecycle.idle(interval).await,
            Some(attempt) => match judge::process_attempt(store, &env, &attempt).await {
                Ok(()) => {}
                Err(JudgeError::Recoverable(message)) => {
                    error!(attempt = attempt.id, "{message}");
                }
                Err(JudgeError::Fatal(e)) => {
                    if let Err(write) = store
                        .update_result(attempt.id, ResultUpdate::state("System error"))
                        .await
                    {
                        warn!(attempt = attempt.id, "failed to record the failure: {write}");
                    }
                    error!(attempt = attempt.id, "system error: {e}");
                    return Err(e.into());
                }
            },
        }
        store.heartbeat(heartbeat).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_implies_restart_and_reports_the_first_delivery() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.restart_pending());
        assert!(!lifecycle.terminating());

        assert!(lifecycle.request_shutdown());
        assert!(lifecycle.restart_pending());
        assert!(lifecycle.terminating());

        // A second delivery is not the first any more.
        assert!(!lifecycle.request_shutdown());
    }

    #[test]
    fn restart_flag_is_rearmable_while_terminate_is_sticky() {
        let lifecycle = Lifecycle::new();
        lifecycle.request_restart();
        assert!(lifecycle.restart_pending());
        assert!(!lifecycle.terminating());

        lifecycle.clear_restart();
        assert!(!lifecycle.restart_pending());

        lifecycle.request_shutdown();
        lifecycle.clear_restart();
        assert!(lifecycle.terminating());
    }

    #[tokio::test]
    async fn idle_returns_early_on_shutdown() {
        let lifecycle = Lifecycle::new();
        let sleeper = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.idle(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        lifecycle.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .expect("idle should wake on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn idle_is_a_no_op_once_a_restart_is_pending() {
        let lifecycle = Lifecycle::new();
        lifecycle.request_restart();
        // Must return immediately, far sooner than the requested hour.
        tokio::time::timeout(
            Duration::from_secs(1),
            lifecycle.idle(Duration::from_secs(3600)),
        )
        .await
        .expect("idle should observe the pending restart");
    }
}
