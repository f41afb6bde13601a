//! Onboarding coordinator
//!
//! Owns the enrollment flow end to end: approval, certificate issuance,
//! the permissive observation rule, profiling, and finalization into a
//! least-privilege policy. Policy enforcement itself is the traffic
//! orchestrator's job; the coordinator announces `PolicyReplaced` and
//! `DeviceStatusChanged` on the bus and the orchestrator reacts.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use trustplane_bus::EventBus;
use trustplane_ca::CertificateAuthority;
use trustplane_core::types::{Device, DeviceId, DeviceStatus, MacAddr, PacketObservation};
use trustplane_core::{Error, Event, Result};
use trustplane_identity::{IdentityStore, PendingDevice};
use trustplane_switch::{
    FlowMatch, ForwardAction, ForwardingRule, InstallOutcome, RetryPolicy, RuleId, SwitchControl,
};
use trustplane_trust::TrustScorer;

use crate::policy::least_privilege_policy;
use crate::profiler::ProfileCollector;
use crate::state_machine::{DeviceStateMachine, LifecycleEvent};

/// Priority of the permissive observation rule installed during profiling
const OBSERVATION_RULE_PRIORITY: u32 = 10;

fn observation_rule_id(device_id: &DeviceId) -> RuleId {
    RuleId::new(format!("obs:{}", device_id))
}

/// Drives the per-device enrollment state machine
pub struct OnboardingCoordinator {
    store: Arc<IdentityStore>,
    ca: Arc<CertificateAuthority>,
    trust: Arc<TrustScorer>,
    switch: Arc<dyn SwitchControl>,
    bus: Arc<EventBus>,
    collector: ProfileCollector,
    profiling_duration: Duration,
    min_packets: u64,
}

impl OnboardingCoordinator {
    pub fn new(
        store: Arc<IdentityStore>,
        ca: Arc<CertificateAuthority>,
        trust: Arc<TrustScorer>,
        switch: Arc<dyn SwitchControl>,
        bus: Arc<EventBus>,
        profiling_duration: Duration,
        min_packets: u64,
    ) -> Self {
        Self {
            store,
            ca,
            trust,
            switch,
            bus,
            collector: ProfileCollector::new(),
            profiling_duration,
            min_packets,
        }
    }

    /// Record a newly discovered device as pending
    pub async fn register_discovered(
        &self,
        mac: MacAddr,
        device_type: &str,
        suggested_id: Option<DeviceId>,
    ) -> Result<DeviceId> {
        self.store
            .register_pending(mac, device_type, suggested_id)
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingDevice>> {
        self.store.list_pending().await
    }

    /// Approve a pending device and open its profiling window
    ///
    /// Issues the certificate, binds the physical identity, installs the
    /// permissive observation rule, and initializes the trust score. A
    /// certificate failure aborts the approval and returns the device to
    /// pending.
    pub async fn approve_device(&self, device_id: &DeviceId, note: &str) -> Result<Device> {
        let device = self.store.approve(device_id, note).await?;

        let issued = match self.ca.issue(&device.id, &device.mac).await {
            Ok(issued) => issued,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "certificate issuance failed; aborting onboarding");
                self.store.return_to_pending(device_id).await?;
                self.bus.publish(Event::OperatorAlert {
                    device_id: Some(device_id.clone()),
                    message: format!("certificate issuance failed: {}", e),
                });
                return Err(e);
            }
        };
        self.store
            .set_cert_serial(device_id, Some(&issued.serial))
            .await?;

        self.trust.initialize(device_id).await?;

        let started_at = device.profiling_started_at.unwrap_or_else(Utc::now);
        self.collector
            .start(device.id.clone(), device.mac, started_at);

        // Allow everything while we watch; counters flow to the poller
        self.install_with_backoff(ForwardingRule {
            id: observation_rule_id(device_id),
            matches: FlowMatch::eth_src(device.mac),
            action: ForwardAction::Monitor,
            priority: OBSERVATION_RULE_PRIORITY,
        })
        .await?;

        self.bus.publish(Event::DeviceStatusChanged {
            device_id: device_id.clone(),
            old_status: DeviceStatus::Pending,
            new_status: DeviceStatus::Profiling,
        });

        tracing::info!(device_id = %device_id, mac = %device.mac, "device approved; profiling started");
        self.store.get_device(device_id).await
    }

    /// Reject a pending device; no certificate is ever issued
    pub async fn reject_device(&self, device_id: &DeviceId, note: &str) -> Result<()> {
        self.store.reject(device_id, note).await?;
        self.bus.publish(Event::DeviceStatusChanged {
            device_id: device_id.clone(),
            old_status: DeviceStatus::Pending,
            new_status: DeviceStatus::Revoked,
        });
        Ok(())
    }

    /// Close the profiling window: baseline, least-privilege policy, active
    pub async fn finalize_device(&self, device_id: &DeviceId) -> Result<()> {
        let device = self.store.get_device(device_id).await?;
        let mut sm = DeviceStateMachine::from_status(device.status);
        sm.transition(LifecycleEvent::WindowElapsed)?;

        let baseline = self.collector.finalize(&device.mac, self.min_packets);
        if baseline.sparse {
            tracing::warn!(device_id = %device_id, "profiling window closed with sparse observations");
        }
        let policy = least_privilege_policy(&baseline);

        self.store.put_baseline(device_id, &baseline).await?;
        self.store.put_policy(device_id, &policy).await?;
        self.store
            .set_status(device_id, DeviceStatus::Active, "profiling window elapsed")
            .await?;
        self.store.clear_profiling_started(device_id).await?;

        // The orchestrator replaces this with the enforced policy; a
        // transient removal failure is retried by the queued adapter
        if let Err(e) = self
            .switch
            .remove_rule(&observation_rule_id(device_id))
            .await
        {
            tracing::warn!(device_id = %device_id, error = %e, "observation rule removal deferred");
        }

        self.bus.publish(Event::PolicyReplaced {
            device_id: device_id.clone(),
        });
        self.bus.publish(Event::DeviceStatusChanged {
            device_id: device_id.clone(),
            old_status: DeviceStatus::Profiling,
            new_status: DeviceStatus::Active,
        });

        tracing::info!(
            device_id = %device_id,
            rules = policy.rules().len(),
            sparse = baseline.sparse,
            "onboarding finalized"
        );
        Ok(())
    }

    /// Revoke a device: flips status, revokes the certificate, announces
    pub async fn revoke_device(&self, device_id: &DeviceId, note: &str) -> Result<()> {
        let device = self.store.get_device(device_id).await?;
        let mut sm = DeviceStateMachine::from_status(device.status);
        sm.transition(LifecycleEvent::Revoke)?;

        self.collector.abort(&device.mac);
        match self.ca.revoke(device_id, note).await {
            Ok(()) => {}
            // A device revoked before cert issuance has nothing to revoke
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let old_status = self
            .store
            .set_status(device_id, DeviceStatus::Revoked, note)
            .await?;
        self.bus.publish(Event::DeviceStatusChanged {
            device_id: device_id.clone(),
            old_status,
            new_status: DeviceStatus::Revoked,
        });
        Ok(())
    }

    /// Isolate a device after a hard failure
    pub async fn quarantine_device(&self, device_id: &DeviceId, reason: &str) -> Result<()> {
        let device = self.store.get_device(device_id).await?;
        let mut sm = DeviceStateMachine::from_status(device.status);
        sm.transition(LifecycleEvent::AttestationHardFail)?;

        let old_status = self
            .store
            .set_status(device_id, DeviceStatus::Quarantined, reason)
            .await?;
        self.bus.publish(Event::DeviceStatusChanged {
            device_id: device_id.clone(),
            old_status,
            new_status: DeviceStatus::Quarantined,
        });
        Ok(())
    }

    /// Administrator releases a quarantined device back to active
    pub async fn release_quarantine(&self, device_id: &DeviceId, note: &str) -> Result<()> {
        let device = self.store.get_device(device_id).await?;
        let mut sm = DeviceStateMachine::from_status(device.status);
        sm.transition(LifecycleEvent::AdminRelease)?;

        let old_status = self
            .store
            .set_status(device_id, DeviceStatus::Active, note)
            .await?;
        self.bus.publish(Event::DeviceStatusChanged {
            device_id: device_id.clone(),
            old_status,
            new_status: DeviceStatus::Active,
        });
        Ok(())
    }

    /// Feed one switch observation into the active profiling sessions
    pub async fn ingest_observation(&self, observation: &PacketObservation) {
        if let Some(device_id) = self.collector.observe(observation) {
            if let Err(e) = self
                .store
                .set_last_seen(&device_id, observation.timestamp)
                .await
            {
                tracing::warn!(device_id = %device_id, error = %e, "failed to record last_seen");
            }
        }
    }

    /// Long-lived worker: drain the switch observation channel
    pub async fn observation_loop(self: Arc<Self>) {
        let mut receiver = self.switch.observations();
        loop {
            match receiver.recv().await {
                Ok(observation) => self.ingest_observation(&observation).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "observation channel lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// One finalization sweep: close every elapsed profiling window
    ///
    /// Reads the persisted start time, so it picks up windows opened
    /// before a restart.
    pub async fn sweep_finalize(&self) {
        let profiling = match self.store.list_by_status(DeviceStatus::Profiling).await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "finalization sweep could not list devices");
                return;
            }
        };

        let now = Utc::now();
        for device in profiling {
            let started = match device.profiling_started_at {
                Some(t) => t,
                None => continue,
            };
            let elapsed = (now - started).num_seconds().max(0) as u64;
            if elapsed >= self.profiling_duration.as_secs() {
                if let Err(e) = self.finalize_device(&device.id).await {
                    tracing::error!(device_id = %device.id, error = %e, "finalization failed");
                }
            }
        }
    }

    /// Re-arm in-memory profiling sessions after a restart
    pub async fn resume_profiling(&self) -> Result<()> {
        for device in self.store.list_by_status(DeviceStatus::Profiling).await? {
            let started = device.profiling_started_at.unwrap_or_else(Utc::now);
            self.collector.start(device.id.clone(), device.mac, started);
        }
        Ok(())
    }

    /// Install a rule with capped exponential backoff; operator alert on
    /// exhaustion
    async fn install_with_backoff(&self, rule: ForwardingRule) -> Result<()> {
        let policy = RetryPolicy::policy_install();
        let mut attempt = 0;
        loop {
            match self.switch.install_rule(rule.clone()).await {
                Ok(InstallOutcome::Installed) => return Ok(()),
                Ok(InstallOutcome::Fatal(reason)) => {
                    return Err(Error::SwitchRuleRejected { reason });
                }
                Ok(InstallOutcome::Retry) | Err(Error::SwitchUnavailable) => {
                    if attempt >= policy.max_retries {
                        self.bus.publish(Event::OperatorAlert {
                            device_id: None,
                            message: format!("rule install failed after {} attempts: {}", attempt, rule.id),
                        });
                        return Err(Error::SwitchUnavailable);
                    }
                    tokio::time::sleep(policy.backoff_duration(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
