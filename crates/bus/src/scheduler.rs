//! Periodic task runner
//!
//! Spawns named tokio tasks on a fixed cadence and stops them cooperatively
//! on shutdown. Tasks must not spin; each tick awaits the interval first so
//! cancellation is observed promptly.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns and tracks the core's periodic workers
pub struct Scheduler {
    shutdown: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token observed by every spawned task
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run `tick` every `period` until shutdown
    pub fn spawn_periodic<F, Fut>(&mut self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = self.shutdown.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(task = %task_name, "periodic task stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        tick().await;
                    }
                }
            }
        });
        self.handles.push((name.to_string(), handle));
    }

    /// Run a long-lived worker future until it completes or shutdown fires
    pub fn spawn_worker<Fut>(&mut self, name: &str, worker: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(task = %task_name, "worker cancelled");
                }
                _ = worker => {
                    tracing::debug!(task = %task_name, "worker finished");
                }
            }
        });
        self.handles.push((name.to_string(), handle));
    }

    /// Signal shutdown and wait for tasks to drain, up to `deadline`
    pub async fn shutdown(self, deadline: Duration) {
        self.shutdown.cancel();
        for (name, handle) in self.handles {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                tracing::warn!(task = %name, "task did not drain before deadline; aborting");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
