//! # trustplane Deception Feedback Loop
//!
//! Turns honeypot activity into actionable threat intelligence. The
//! ingestor tails the honeypot's newline-delimited JSON event log and
//! maintains the threat table; the mitigation generator converts confirmed
//! threats into deny/redirect/monitor rules for the orchestrator.
//!
//! Threats idle past their TTL are aged out, and non-permanent mitigation
//! rules expire with them.

pub mod ingestor;
pub mod mitigation;

pub use ingestor::{HoneypotEvent, HoneypotIngestor};
pub use mitigation::{rule_for_threat, MitigationGenerator};
