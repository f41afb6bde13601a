//! Reconnect-hiding decorator
//!
//! Wraps any `SwitchControl` implementation and hides transient
//! disconnects by queuing rule operations. Once the queue fills or the
//! disconnect outlasts `max_disconnect`, calls surface
//! `SwitchUnavailable` and the orchestrator fails closed.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use trustplane_core::types::PacketObservation;
use trustplane_core::{Error, Result};

use crate::adapter::{
    DeviceFlowSample, ForwardingRule, InstallOutcome, RuleId, SwitchControl,
};

#[derive(Debug, Clone)]
enum QueuedOp {
    Install(ForwardingRule),
    Remove(RuleId),
}

struct DisconnectState {
    since: Option<Instant>,
    /// Set once the outage exceeded max_disconnect; cleared on reconnect
    surfaced: bool,
}

/// Queue-on-disconnect wrapper around a switch backend
pub struct QueuedSwitch<S> {
    inner: S,
    queue: Mutex<VecDeque<QueuedOp>>,
    state: Mutex<DisconnectState>,
    max_queue: usize,
    max_disconnect: Duration,
    call_timeout: Duration,
}

impl<S: SwitchControl> QueuedSwitch<S> {
    pub fn new(inner: S, max_queue: usize, max_disconnect: Duration, call_timeout: Duration) -> Self {
        Self {
            inner,
            queue: Mutex::new(VecDeque::new()),
            state: Mutex::new(DisconnectState {
                since: None,
                surfaced: false,
            }),
            max_queue,
            max_disconnect,
            call_timeout,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Whether the adapter is currently usable (possibly via the queue)
    pub fn is_available(&self) -> bool {
        !self.state.lock().unwrap().surfaced
    }

    /// Pending operations waiting for the switch to come back
    pub fn queued_ops(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn note_failure(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let since = *state.since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.max_disconnect {
            state.surfaced = true;
        }
        state.surfaced
    }

    fn note_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.since = None;
        state.surfaced = false;
    }

    fn enqueue(&self, op: QueuedOp) -> Result<()> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.max_queue {
            self.state.lock().unwrap().surfaced = true;
            return Err(Error::SwitchUnavailable);
        }
        // Re-queueing the same rule id replaces the stale op
        if let QueuedOp::Install(rule) = &op {
            queue.retain(|queued| !matches!(queued, QueuedOp::Install(r) if r.id == rule.id));
        }
        queue.push_back(op);
        Ok(())
    }

    async fn try_install(&self, rule: ForwardingRule) -> Result<InstallOutcome> {
        match tokio::time::timeout(self.call_timeout, self.inner.install_rule(rule)).await {
            Ok(result) => result,
            Err(_) => Err(Error::SwitchUnavailable),
        }
    }

    /// Drain the queue against the backend; called periodically
    ///
    /// Returns the number of operations flushed. A queue that cannot be
    /// drained yet is left intact for the next attempt.
    pub async fn flush(&self) -> usize {
        let mut flushed = 0;
        loop {
            let op = {
                let mut queue = self.queue.lock().unwrap();
                match queue.pop_front() {
                    Some(op) => op,
                    None => break,
                }
            };

            let outcome = match op.clone() {
                QueuedOp::Install(rule) => self.try_install(rule).await.map(Some),
                QueuedOp::Remove(rule_id) => {
                    match tokio::time::timeout(self.call_timeout, self.inner.remove_rule(&rule_id))
                        .await
                    {
                        Ok(Ok(())) => Ok(None),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(Error::SwitchUnavailable),
                    }
                }
            };

            match outcome {
                Ok(Some(InstallOutcome::Retry)) | Err(Error::SwitchUnavailable) => {
                    // Still down; put it back and stop this round
                    self.queue.lock().unwrap().push_front(op);
                    self.note_failure();
                    break;
                }
                Ok(Some(InstallOutcome::Fatal(reason))) => {
                    tracing::error!(reason, "queued rule rejected by switch; dropping");
                    self.note_success();
                    flushed += 1;
                }
                Ok(_) => {
                    self.note_success();
                    flushed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "queued operation failed; dropping");
                    flushed += 1;
                }
            }
        }
        flushed
    }
}

#[async_trait]
impl<S: SwitchControl> SwitchControl for QueuedSwitch<S> {
    async fn install_rule(&self, rule: ForwardingRule) -> Result<InstallOutcome> {
        if !self.is_available() {
            return Err(Error::SwitchUnavailable);
        }

        match self.try_install(rule.clone()).await {
            Ok(InstallOutcome::Installed) => {
                self.note_success();
                Ok(InstallOutcome::Installed)
            }
            Ok(InstallOutcome::Fatal(reason)) => Err(Error::SwitchRuleRejected { reason }),
            Ok(InstallOutcome::Retry) | Err(Error::SwitchUnavailable) => {
                if self.note_failure() {
                    return Err(Error::SwitchUnavailable);
                }
                self.enqueue(QueuedOp::Install(rule))?;
                // Hidden from the caller: queued counts as installed
                Ok(InstallOutcome::Installed)
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_rule(&self, rule_id: &RuleId) -> Result<()> {
        if !self.is_available() {
            return Err(Error::SwitchUnavailable);
        }

        match tokio::time::timeout(self.call_timeout, self.inner.remove_rule(rule_id)).await {
            Ok(Ok(())) => {
                self.note_success();
                Ok(())
            }
            Ok(Err(Error::SwitchUnavailable)) | Err(_) => {
                if self.note_failure() {
                    return Err(Error::SwitchUnavailable);
                }
                self.enqueue(QueuedOp::Remove(rule_id.clone()))
            }
            Ok(Err(e)) => Err(e),
        }
    }

    async fn list_rules(&self) -> Result<Vec<ForwardingRule>> {
        match tokio::time::timeout(self.call_timeout, self.inner.list_rules()).await {
            Ok(result) => result,
            Err(_) => Err(Error::SwitchUnavailable),
        }
    }

    async fn flow_stats(&self) -> Result<Vec<DeviceFlowSample>> {
        match tokio::time::timeout(self.call_timeout, self.inner.flow_stats()).await {
            Ok(result) => result,
            Err(_) => Err(Error::SwitchUnavailable),
        }
    }

    fn observations(&self) -> broadcast::Receiver<PacketObservation> {
        self.inner.observations()
    }
}
