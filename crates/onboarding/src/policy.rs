//! Least-privilege policy derivation

use trustplane_core::types::{Baseline, Policy, PolicyRule, RuleAction, RuleMatch};

/// Priority for baseline-derived allow rules
const ALLOW_PRIORITY: u32 = 100;

/// Derive the least-privilege policy from a finalized baseline
///
/// One allow rule per observed destination IP and per observed destination
/// port, all at priority 100, terminated by the default deny at 0. A
/// device that was silent during profiling gets the bare deny-all policy.
pub fn least_privilege_policy(baseline: &Baseline) -> Policy {
    let mut rules = Vec::with_capacity(baseline.dst_ips.len() + baseline.dst_ports.len() + 1);

    for &ip in &baseline.dst_ips {
        rules.push(PolicyRule {
            matches: RuleMatch::dst_ip(ip),
            action: RuleAction::Allow,
            priority: ALLOW_PRIORITY,
        });
    }
    for &port in &baseline.dst_ports {
        rules.push(PolicyRule {
            matches: RuleMatch::dst_port(port),
            action: RuleAction::Allow,
            priority: ALLOW_PRIORITY,
        });
    }

    Policy::with_default_deny(rules)
}
