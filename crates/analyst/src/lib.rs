//! # trustplane Analyst
//!
//! The heuristic side of the core: polls per-device flow counters from the
//! switch adapter, compares each window against the device's behavioral
//! baseline, and raises severity-tagged alerts. Also runs the periodic
//! attestation loop that verifies certificate validity and liveness.
//!
//! Attack traffic is never learned: the baseline adapts (EMA, α = 0.1)
//! only on windows in which no anomaly rule fired.

pub mod anomaly;
pub mod attestation;
pub mod poller;

pub use anomaly::{evaluate_window, AnomalyDetector};
pub use attestation::AttestationLoop;
pub use poller::FlowPoller;
