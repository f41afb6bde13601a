//! # trustplane Onboarding
//!
//! Drives the device enrollment lifecycle: approval, certificate issuance,
//! the time-bounded behavioral profiling window, and the least-privilege
//! policy generated when the window closes.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──approve──▶ profiling ──window_elapsed──▶ active
//! pending ──reject──▶ revoked
//! profiling ──revoke──▶ revoked
//! active ──revoke──▶ revoked
//! any ──attestation_hard_fail──▶ quarantined
//! ```
//!
//! A background sweep checks profiling devices every 30 seconds and
//! finalizes any whose window has elapsed; it re-reads the persisted
//! profiling start time, so a crash mid-window loses nothing but the
//! in-memory observation counters.

pub mod coordinator;
pub mod policy;
pub mod profiler;
pub mod state_machine;

pub use coordinator::OnboardingCoordinator;
pub use policy::least_privilege_policy;
pub use profiler::ProfileCollector;
pub use state_machine::{DeviceStateMachine, LifecycleEvent};
