//! The decision function and recovery gating
//!
//! Pure functions: the engine feeds them observable state and installs
//! whatever they return, which is what makes the idempotence property
//! testable.

use trustplane_core::types::{Decision, DeviceStatus, Severity};

/// Trust required to recover into each decision level (threshold + hysteresis)
pub const RECOVERY_FLOOR_ALLOW: i64 = 75;
pub const RECOVERY_FLOOR_REDIRECT: i64 = 55;
pub const RECOVERY_FLOOR_DENY: i64 = 35;

/// Observable state the decision is computed from
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs {
    pub status: DeviceStatus,
    pub trust: i64,
    /// Highest alert severity within the alert window, if any
    pub highest_recent_severity: Option<Severity>,
}

/// The decision function; first match wins
pub fn decide(inputs: &DecisionInputs) -> (Decision, String) {
    let severity = inputs.highest_recent_severity;

    if matches!(
        inputs.status,
        DeviceStatus::Revoked | DeviceStatus::Quarantined
    ) {
        return (
            Decision::Quarantine,
            format!("status is {}", inputs.status),
        );
    }
    if severity == Some(Severity::Critical) {
        return (Decision::Quarantine, "critical alert in window".to_string());
    }
    if severity == Some(Severity::High) || inputs.trust < 30 {
        return (
            Decision::Quarantine,
            format!("high alert or trust {} < 30", inputs.trust),
        );
    }
    if severity == Some(Severity::Medium) || inputs.trust < 50 {
        return (
            Decision::Deny,
            format!("medium alert or trust {} < 50", inputs.trust),
        );
    }
    if inputs.trust < 70 {
        return (Decision::Redirect, format!("trust {} < 70", inputs.trust));
    }
    (Decision::Allow, "device policy applies".to_string())
}

/// Minimum trust required to land on `decision` via recovery
fn recovery_floor(decision: Decision) -> i64 {
    match decision {
        Decision::Allow => RECOVERY_FLOOR_ALLOW,
        Decision::Redirect => RECOVERY_FLOOR_REDIRECT,
        Decision::Deny => RECOVERY_FLOOR_DENY,
        Decision::Quarantine => 0,
    }
}

/// Gate a computed decision against the currently installed one
///
/// Degradation applies immediately. Recovery (moving to a less
/// restrictive decision) requires trust at or above the target's floor
/// (threshold + hysteresis) and no alert ≥ medium inside the recovery
/// window. Recovery out of quarantine happens only through explicit
/// administrator action, which clears the installed state first.
pub fn gate_recovery(
    current: Option<Decision>,
    target: Decision,
    trust: i64,
    quiet_recovery_window: bool,
) -> Decision {
    let current = match current {
        Some(current) => current,
        None => return target,
    };

    if target.restriction_level() >= current.restriction_level() {
        return target;
    }

    // Recovery path
    if current == Decision::Quarantine {
        return Decision::Quarantine;
    }
    if !quiet_recovery_window || trust < recovery_floor(target) {
        return current;
    }
    target
}
