//! Property-based tests for the decision function

use proptest::prelude::*;
use trustplane_core::types::{Decision, DeviceStatus, Severity};
use trustplane_orchestrator::{decide, gate_recovery, DecisionInputs};

fn arb_status() -> impl Strategy<Value = DeviceStatus> {
    prop_oneof![
        Just(DeviceStatus::Pending),
        Just(DeviceStatus::Profiling),
        Just(DeviceStatus::Active),
        Just(DeviceStatus::Revoked),
        Just(DeviceStatus::Quarantined),
    ]
}

fn arb_severity() -> impl Strategy<Value = Option<Severity>> {
    prop_oneof![
        Just(None),
        Just(Some(Severity::Low)),
        Just(Some(Severity::Medium)),
        Just(Some(Severity::High)),
        Just(Some(Severity::Critical)),
    ]
}

fn arb_decision() -> impl Strategy<Value = Decision> {
    prop_oneof![
        Just(Decision::Allow),
        Just(Decision::Redirect),
        Just(Decision::Deny),
        Just(Decision::Quarantine),
    ]
}

proptest! {
    // Property: revoked or quarantined devices are never allowed
    #[test]
    fn prop_revoked_never_allowed(trust in 0i64..=100, severity in arb_severity()) {
        for status in [DeviceStatus::Revoked, DeviceStatus::Quarantined] {
            let (decision, _) = decide(&DecisionInputs {
                status,
                trust,
                highest_recent_severity: severity,
            });
            prop_assert_eq!(decision, Decision::Quarantine);
        }
    }

    // Property: the decision function is deterministic
    #[test]
    fn prop_decide_deterministic(
        status in arb_status(),
        trust in 0i64..=100,
        severity in arb_severity(),
    ) {
        let inputs = DecisionInputs {
            status,
            trust,
            highest_recent_severity: severity,
        };
        let (a, _) = decide(&inputs);
        let (b, _) = decide(&inputs);
        prop_assert_eq!(a, b);
    }

    // Property: with fixed severity, lower trust is never less restrictive
    #[test]
    fn prop_lower_trust_never_less_restrictive(
        trust_a in 0i64..=100,
        trust_b in 0i64..=100,
        severity in arb_severity(),
    ) {
        let (lower, higher) = if trust_a <= trust_b {
            (trust_a, trust_b)
        } else {
            (trust_b, trust_a)
        };
        let (decision_low, _) = decide(&DecisionInputs {
            status: DeviceStatus::Active,
            trust: lower,
            highest_recent_severity: severity,
        });
        let (decision_high, _) = decide(&DecisionInputs {
            status: DeviceStatus::Active,
            trust: higher,
            highest_recent_severity: severity,
        });
        prop_assert!(decision_low.restriction_level() >= decision_high.restriction_level());
    }

    // Property: gating never produces something less restrictive than the
    // target allows, and degradation always goes through
    #[test]
    fn prop_gate_never_softens_degradation(
        current in arb_decision(),
        target in arb_decision(),
        trust in 0i64..=100,
        quiet in any::<bool>(),
    ) {
        let gated = gate_recovery(Some(current), target, trust, quiet);
        if target.restriction_level() >= current.restriction_level() {
            prop_assert_eq!(gated, target);
        } else {
            // Recovery: either granted exactly, or held at current
            prop_assert!(gated == target || gated == current);
        }
    }

    // Property: quarantine never recovers through the gate
    #[test]
    fn prop_quarantine_sticks(target in arb_decision(), trust in 0i64..=100, quiet in any::<bool>()) {
        let gated = gate_recovery(Some(Decision::Quarantine), target, trust, quiet);
        if target == Decision::Quarantine {
            prop_assert_eq!(gated, Decision::Quarantine);
        } else {
            prop_assert_eq!(gated, Decision::Quarantine);
        }
    }
}
