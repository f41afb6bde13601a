//! Event loop, rule installation, and fail-closed handling

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use trustplane_bus::{BusReceiver, EventBus};
use trustplane_core::types::{
    Alert, AuditRecord, Decision, Device, DeviceId, DeviceStatus, MitigationRule, Policy,
    RuleAction, Severity,
};
use trustplane_core::{Error, Event, Result};
use trustplane_identity::IdentityStore;
use trustplane_switch::{
    FlowMatch, ForwardAction, ForwardingRule, InstallOutcome, RetryPolicy, RuleId, SwitchControl,
};

use crate::decision::{decide, gate_recovery, DecisionInputs};

/// Priority of the single drop rule for DENY
const DENY_PRIORITY: u32 = 200;
/// Priority of the redirect rule
const REDIRECT_PRIORITY: u32 = 150;
/// Top-of-table priority for QUARANTINE
const QUARANTINE_PRIORITY: u32 = 65535;

/// The single writer of device-scoped forwarding rules
pub struct TrafficOrchestrator {
    store: Arc<IdentityStore>,
    bus: Arc<EventBus>,
    switch: Arc<dyn SwitchControl>,
    /// Idempotency: installs happen only when the decision changes
    last_installed: DashMap<DeviceId, Decision>,
    /// Rule ids currently on the switch for each device
    device_rules: DashMap<DeviceId, Vec<RuleId>>,
    /// Alerts inside the alert window, newest at the back
    recent_alerts: DashMap<DeviceId, VecDeque<(DateTime<Utc>, Severity)>>,
    /// Installed cross-device mitigations, keyed by source IP
    mitigations: DashMap<IpAddr, MitigationRule>,
    locks: DashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>,
    alert_window: ChronoDuration,
    recovery_window: ChronoDuration,
    honeypot_port: Option<u32>,
    install_retries: u32,
}

impl TrafficOrchestrator {
    pub fn new(
        store: Arc<IdentityStore>,
        bus: Arc<EventBus>,
        switch: Arc<dyn SwitchControl>,
        alert_window_secs: u64,
        recovery_window_secs: u64,
        honeypot_port: Option<u32>,
    ) -> Self {
        Self {
            store,
            bus,
            switch,
            last_installed: DashMap::new(),
            device_rules: DashMap::new(),
            recent_alerts: DashMap::new(),
            mitigations: DashMap::new(),
            locks: DashMap::new(),
            alert_window: ChronoDuration::seconds(alert_window_secs as i64),
            recovery_window: ChronoDuration::seconds(recovery_window_secs as i64),
            honeypot_port,
            install_retries: RetryPolicy::fail_closed().max_retries,
        }
    }

    /// Override the install attempt budget (config `rule_install_retries`)
    pub fn with_install_retries(mut self, retries: u32) -> Self {
        self.install_retries = retries;
        self
    }

    fn lock_for(&self, device_id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Long-lived worker: consume the bus and keep the switch in line
    ///
    /// A single consumer loop, so per-device event ordering follows
    /// arrival order.
    pub async fn run(self: Arc<Self>, mut receiver: BusReceiver) {
        while let Some(event) = receiver.recv().await {
            self.handle_event(event).await;
        }
    }

    /// Dispatch one event
    pub async fn handle_event(&self, event: Event) {
        let result = match event {
            Event::DeviceStatusChanged {
                device_id,
                old_status,
                new_status,
            } => {
                // Leaving quarantine is an explicit admin action; it
                // resets the installed state so recovery gating does not
                // pin the device
                if old_status == DeviceStatus::Quarantined
                    && new_status != DeviceStatus::Quarantined
                {
                    self.last_installed.remove(&device_id);
                }
                self.apply(&device_id).await
            }
            Event::TrustChanged { device_id, .. } => self.apply(&device_id).await,
            Event::AlertRaised(alert) => {
                self.record_alert(&alert);
                self.apply(&alert.device_id).await
            }
            Event::PolicyReplaced { device_id } => {
                // Force a reinstall even if the decision name is unchanged
                self.last_installed.remove(&device_id);
                self.apply(&device_id).await
            }
            Event::MitigationProposed(rule) => self.install_mitigation(rule).await,
            Event::ThreatExpired { source_ip } => self.expire_mitigation(source_ip).await,
            Event::FlowSample { .. }
            | Event::ThreatUpdated { .. }
            | Event::OperatorAlert { .. } => Ok(()),
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "orchestrator event handling failed");
        }
    }

    fn record_alert(&self, alert: &Alert) {
        let mut alerts = self
            .recent_alerts
            .entry(alert.device_id.clone())
            .or_insert_with(VecDeque::new);
        alerts.push_back((alert.timestamp, alert.severity));
        // Prune against the longer of the two windows
        let horizon = Utc::now() - self.alert_window.max(self.recovery_window);
        while alerts.front().is_some_and(|(t, _)| *t < horizon) {
            alerts.pop_front();
        }
    }

    fn highest_recent_severity(&self, device_id: &DeviceId) -> Option<Severity> {
        let cutoff = Utc::now() - self.alert_window;
        self.recent_alerts.get(device_id).and_then(|alerts| {
            alerts
                .iter()
                .filter(|(t, _)| *t >= cutoff)
                .map(|(_, s)| *s)
                .max()
        })
    }

    /// No alert ≥ medium within the recovery window
    fn quiet_recovery_window(&self, device_id: &DeviceId) -> bool {
        let cutoff = Utc::now() - self.recovery_window;
        self.recent_alerts
            .get(device_id)
            .map(|alerts| {
                !alerts
                    .iter()
                    .any(|(t, s)| *t >= cutoff && *s >= Severity::Medium)
            })
            .unwrap_or(true)
    }

    /// Recompute and, if changed, install the decision for one device
    pub async fn apply(&self, device_id: &DeviceId) -> Result<()> {
        let lock = self.lock_for(device_id);
        let _guard = lock.lock().await;

        let device = match self.store.get_device(device_id).await {
            Ok(device) => device,
            // Events may race device removal; nothing to decide then
            Err(Error::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        // Pending and profiling devices are not under decision control;
        // the observation rule governs profiling traffic
        if matches!(
            device.status,
            DeviceStatus::Pending | DeviceStatus::Profiling
        ) {
            return Ok(());
        }

        let trust = self.store.current_trust(device_id).await?;
        let severity = self.highest_recent_severity(device_id);
        let (target, mut reason) = decide(&DecisionInputs {
            status: device.status,
            trust,
            highest_recent_severity: severity,
        });

        let current = self.last_installed.get(device_id).map(|d| *d);
        let decision = gate_recovery(
            current,
            target,
            trust,
            self.quiet_recovery_window(device_id),
        );
        if decision != target {
            reason = format!("recovery to {} gated; holding {}", target, decision);
        }

        if current == Some(decision) {
            return Ok(());
        }

        match self.install_decision(&device, decision).await {
            Ok(()) => {
                self.last_installed.insert(device_id.clone(), decision);
                self.audit(&device, trust, severity, decision, &reason, current)
                    .await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "decision install failed; failing closed");
                self.fail_closed(&device, target, trust, severity, current)
                    .await
            }
        }
    }

    /// Translate a decision into forwarding rules and swap them in
    async fn install_decision(&self, device: &Device, decision: Decision) -> Result<()> {
        let rules = self.rules_for(device, decision).await?;
        let new_ids: Vec<RuleId> = rules.iter().map(|r| r.id.clone()).collect();

        for rule in rules {
            self.install_with_retries(rule).await?;
        }

        // Drop whatever this device had before that is no longer wanted;
        // for quarantine this removes the prior allow rules
        let stale: Vec<RuleId> = self
            .device_rules
            .insert(device.id.clone(), new_ids.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !new_ids.contains(id))
            .collect();
        for rule_id in stale {
            if let Err(e) = self.switch.remove_rule(&rule_id).await {
                tracing::warn!(rule_id = %rule_id, error = %e, "stale rule removal failed");
            }
        }
        Ok(())
    }

    async fn rules_for(&self, device: &Device, decision: Decision) -> Result<Vec<ForwardingRule>> {
        let id = &device.id;
        let rules = match decision {
            Decision::Allow => {
                let policy = self
                    .store
                    .get_policy(id)
                    .await?
                    .unwrap_or_else(Policy::deny_all);
                self.policy_rules(device, &policy)?
            }
            Decision::Redirect => {
                let port = self.honeypot_port.ok_or_else(|| {
                    Error::conflict("capability_absent: honeypot_port not configured")
                })?;
                vec![ForwardingRule {
                    id: RuleId::new(format!("dev:{}:redirect", id)),
                    matches: FlowMatch::eth_src(device.mac),
                    action: ForwardAction::Output { port },
                    priority: REDIRECT_PRIORITY,
                }]
            }
            Decision::Deny => vec![ForwardingRule {
                id: RuleId::new(format!("dev:{}:deny", id)),
                matches: FlowMatch::eth_src(device.mac),
                action: ForwardAction::Drop,
                priority: DENY_PRIORITY,
            }],
            Decision::Quarantine => vec![ForwardingRule {
                id: RuleId::new(format!("dev:{}:quarantine", id)),
                matches: FlowMatch::eth_src(device.mac),
                action: ForwardAction::Drop,
                priority: QUARANTINE_PRIORITY,
            }],
        };
        Ok(rules)
    }

    /// The device's stored policy, verbatim, scoped to its MAC
    fn policy_rules(&self, device: &Device, policy: &Policy) -> Result<Vec<ForwardingRule>> {
        policy
            .rules()
            .iter()
            .enumerate()
            .map(|(idx, rule)| {
                let action = match rule.action {
                    RuleAction::Allow => ForwardAction::Normal,
                    RuleAction::Deny => ForwardAction::Drop,
                    RuleAction::Monitor => ForwardAction::Monitor,
                    RuleAction::Redirect => match self.honeypot_port {
                        Some(port) => ForwardAction::Output { port },
                        // Redirect without a honeypot degrades to drop
                        None => ForwardAction::Drop,
                    },
                };
                Ok(ForwardingRule {
                    id: RuleId::new(format!("dev:{}:policy:{}", device.id, idx)),
                    matches: FlowMatch {
                        eth_src: Some(device.mac),
                        src_ip: None,
                        dst_ip: rule.matches.dst_ip,
                        dst_port: rule.matches.dst_port,
                        protocol: rule.matches.protocol,
                    },
                    action,
                    priority: rule.priority,
                })
            })
            .collect()
    }

    async fn install_with_retries(&self, rule: ForwardingRule) -> Result<()> {
        let policy = RetryPolicy {
            max_retries: self.install_retries,
            ..RetryPolicy::fail_closed()
        };
        let mut attempt = 0;
        loop {
            match self.switch.install_rule(rule.clone()).await {
                Ok(InstallOutcome::Installed) => return Ok(()),
                Ok(InstallOutcome::Fatal(reason)) => {
                    return Err(Error::SwitchRuleRejected { reason });
                }
                Ok(InstallOutcome::Retry) | Err(Error::SwitchUnavailable) => {
                    if attempt >= policy.max_retries {
                        return Err(Error::SwitchUnavailable);
                    }
                    tokio::time::sleep(policy.backoff_duration(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Install retries exhausted: force the device closed
    async fn fail_closed(
        &self,
        device: &Device,
        target: Decision,
        trust: i64,
        severity: Option<Severity>,
        prev: Option<Decision>,
    ) -> Result<()> {
        let decision = if target == Decision::Quarantine {
            Decision::Quarantine
        } else {
            Decision::Deny
        };

        // Best effort; the switch may be gone entirely, but the recorded
        // state must already be closed when it returns
        let drop_rule = ForwardingRule {
            id: RuleId::new(format!("dev:{}:deny", device.id)),
            matches: FlowMatch::eth_src(device.mac),
            action: ForwardAction::Drop,
            priority: if decision == Decision::Quarantine {
                QUARANTINE_PRIORITY
            } else {
                DENY_PRIORITY
            },
        };
        let drop_rule_id = drop_rule.id.clone();
        if let Err(e) = self.switch.install_rule(drop_rule).await {
            tracing::warn!(device_id = %device.id, error = %e, "fail-closed install could not reach switch");
        }

        // Track the drop rule (and forget the old set) so a later
        // recovery removes it
        let stale: Vec<RuleId> = self
            .device_rules
            .insert(device.id.clone(), vec![drop_rule_id.clone()])
            .unwrap_or_default()
            .into_iter()
            .filter(|id| *id != drop_rule_id)
            .collect();
        for rule_id in stale {
            if let Err(e) = self.switch.remove_rule(&rule_id).await {
                tracing::debug!(rule_id = %rule_id, error = %e, "stale rule removal deferred");
            }
        }

        self.last_installed.insert(device.id.clone(), decision);
        self.bus.publish(Event::OperatorAlert {
            device_id: Some(device.id.clone()),
            message: format!("rule install failed; {} forced to {}", device.id, decision),
        });
        self.audit(
            device,
            trust,
            severity,
            decision,
            "fail-closed after exhausted install retries",
            prev,
        )
        .await;
        Ok(())
    }

    async fn audit(
        &self,
        device: &Device,
        trust: i64,
        threat_level: Option<Severity>,
        decision: Decision,
        reason: &str,
        prev_decision: Option<Decision>,
    ) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            device_id: device.id.clone(),
            trust,
            threat_level,
            decision,
            reason: reason.to_string(),
            prev_decision,
            correlation_id: AuditRecord::new_correlation_id(),
        };
        tracing::info!(
            device_id = %device.id,
            decision = %decision,
            trust,
            reason,
            correlation_id = %record.correlation_id,
            "decision installed"
        );
        if let Err(e) = self.store.append_audit(&record).await {
            tracing::error!(device_id = %device.id, error = %e, "audit append failed");
        }
    }

    // ---- mitigations ---------------------------------------------------

    /// Install a cross-device mitigation rule; idempotent per source IP
    pub async fn install_mitigation(&self, rule: MitigationRule) -> Result<()> {
        if self
            .mitigations
            .get(&rule.source_ip)
            .map(|existing| *existing == rule)
            .unwrap_or(false)
        {
            return Ok(());
        }

        let action = match rule.action {
            RuleAction::Deny => ForwardAction::Drop,
            RuleAction::Redirect => match self.honeypot_port {
                Some(port) => ForwardAction::Output { port },
                // No honeypot to redirect to: drop is the safe reading
                None => ForwardAction::Drop,
            },
            RuleAction::Monitor => ForwardAction::Monitor,
            RuleAction::Allow => {
                return Err(Error::PolicyViolation(
                    "mitigation rules cannot allow".to_string(),
                ))
            }
        };

        self.install_with_retries(ForwardingRule {
            id: RuleId::new(format!("mit:{}", rule.source_ip)),
            matches: FlowMatch::src_ip(rule.source_ip),
            action,
            priority: rule.priority,
        })
        .await?;

        self.store.put_mitigation(&rule).await?;
        tracing::info!(
            src_ip = %rule.source_ip,
            action = %rule.action,
            permanent = rule.permanent,
            "mitigation installed"
        );
        self.mitigations.insert(rule.source_ip, rule);
        Ok(())
    }

    /// Threat aged out: non-permanent mitigations expire with it
    async fn expire_mitigation(&self, source_ip: IpAddr) -> Result<()> {
        let permanent = match self.mitigations.get(&source_ip) {
            Some(rule) => rule.permanent,
            None => return Ok(()),
        };
        if permanent {
            return Ok(());
        }

        self.switch
            .remove_rule(&RuleId::new(format!("mit:{}", source_ip)))
            .await?;
        self.store.delete_mitigation(source_ip).await?;
        self.mitigations.remove(&source_ip);
        tracing::info!(src_ip = %source_ip, "mitigation expired with its threat");
        Ok(())
    }

    // ---- restart and recovery ------------------------------------------

    /// Rebuild switch state from the store after a restart
    ///
    /// Permanent mitigations are always reinstalled; non-permanent ones
    /// only while their source threat is still live. Every enforced
    /// device is then re-decided from current observable state.
    pub async fn restore_state(&self) -> Result<()> {
        for rule in self.store.list_mitigations().await? {
            let keep = rule.permanent
                || self.store.get_threat(rule.origin_threat).await?.is_some();
            if keep {
                // Seed the dedup map empty so the install goes through
                self.mitigations.remove(&rule.source_ip);
                if let Err(e) = self.install_mitigation(rule.clone()).await {
                    tracing::error!(src_ip = %rule.source_ip, error = %e, "mitigation restore failed");
                }
            } else {
                self.store.delete_mitigation(rule.source_ip).await?;
            }
        }

        self.resync_devices().await
    }

    /// Recompute every enforced device from scratch; used after restart
    /// and after the switch comes back from an outage
    pub async fn resync_devices(&self) -> Result<()> {
        for device in self.store.list_devices().await? {
            if matches!(
                device.status,
                DeviceStatus::Pending | DeviceStatus::Profiling
            ) {
                continue;
            }
            self.last_installed.remove(&device.id);
            if let Err(e) = self.apply(&device.id).await {
                tracing::error!(device_id = %device.id, error = %e, "device resync failed");
            }
        }
        Ok(())
    }

    /// The decision currently installed for a device, if any
    pub fn current_decision(&self, device_id: &DeviceId) -> Option<Decision> {
        self.last_installed.get(device_id).map(|d| *d)
    }
}
