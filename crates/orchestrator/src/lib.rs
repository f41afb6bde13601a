//! # trustplane Traffic Orchestrator
//!
//! The single decision point of the policy core. Every signal that can
//! change how a device's traffic is handled — a trust threshold crossing,
//! an anomaly alert, a threat update, a policy replacement, a status flip —
//! re-enters here, is fused into one of four decisions (allow / redirect /
//! deny / quarantine), and is translated into forwarding rules on the
//! switch adapter.
//!
//! The orchestrator is the only writer of device-scoped rules. It keeps
//! `last_installed` per device and only touches the switch when the
//! decision actually changes; degradation is immediate, recovery is gated
//! by hysteresis and a quiet window, and rule-install failure fails closed.

pub mod decision;
pub mod engine;

pub use decision::{decide, gate_recovery, DecisionInputs, RECOVERY_FLOOR_ALLOW, RECOVERY_FLOOR_DENY, RECOVERY_FLOOR_REDIRECT};
pub use engine::TrafficOrchestrator;
