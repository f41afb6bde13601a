//! # trustplane Core
//!
//! Common types, events, and error definitions shared across all trustplane
//! modules.
//!
//! ## Module Structure
//!
//! - `types`: Core type definitions (DeviceId, MacAddr, Device, Policy, ...)
//! - `error`: Unified error taxonomy
//! - `events`: Event definitions for the event bus

pub mod error;
pub mod events;
pub mod types;

pub use error::{AttestationReason, Error, Result};
pub use events::Event;
pub use types::{
    Alert, AlertKind, AuditRecord, Baseline, Decision, Device, DeviceId, DeviceStatus, FlowStats,
    MacAddr, MitigationRule, PacketObservation, Policy, PolicyRule, Protocol, RuleAction,
    RuleMatch, Severity, Threat, TrustEvent,
};
