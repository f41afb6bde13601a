//! Threat → mitigation rule generation

use std::net::IpAddr;
use std::sync::Arc;
use trustplane_bus::{BusReceiver, EventBus};
use trustplane_core::types::{MitigationRule, RuleAction, Severity};
use trustplane_core::Event;

/// Mitigation priorities by severity tier
const DENY_PRIORITY: u32 = 200;
const REDIRECT_PRIORITY: u32 = 150;
const MONITOR_PRIORITY: u32 = 100;

/// Build the mitigation rule for a threat at the given severity
///
/// high/critical → permanent deny; medium → redirect to the honeypot;
/// low → monitor only. Installation and deduplication are the
/// orchestrator's responsibility.
pub fn rule_for_threat(source_ip: IpAddr, severity: Severity) -> MitigationRule {
    let (action, priority, permanent) = match severity {
        Severity::High | Severity::Critical => (RuleAction::Deny, DENY_PRIORITY, true),
        Severity::Medium => (RuleAction::Redirect, REDIRECT_PRIORITY, false),
        Severity::Low => (RuleAction::Monitor, MONITOR_PRIORITY, false),
    };

    MitigationRule {
        source_ip,
        action,
        priority,
        reason: format!("honeypot threat severity {}", severity),
        origin_threat: source_ip,
        permanent,
    }
}

/// Subscribes to threat updates and proposes mitigation rules
pub struct MitigationGenerator {
    bus: Arc<EventBus>,
}

impl MitigationGenerator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Long-lived worker: turn every ThreatUpdated into a proposal
    pub async fn run(self: Arc<Self>, mut receiver: BusReceiver) {
        while let Some(event) = receiver.recv().await {
            if let Event::ThreatUpdated {
                source_ip,
                severity,
            } = event
            {
                self.propose(source_ip, severity);
            }
        }
    }

    /// Emit one proposal; exposed for tests and direct wiring
    pub fn propose(&self, source_ip: IpAddr, severity: Severity) {
        let rule = rule_for_threat(source_ip, severity);
        tracing::info!(
            src_ip = %source_ip,
            action = %rule.action,
            priority = rule.priority,
            permanent = rule.permanent,
            "mitigation proposed"
        );
        self.bus.publish(Event::MitigationProposed(rule));
    }
}
