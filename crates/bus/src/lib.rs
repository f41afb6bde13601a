//! # trustplane Event Bus & Scheduler
//!
//! In-process pub/sub wiring the policy core's workers together, plus a
//! small periodic task runner.
//!
//! The bus owns no state; it forwards. Per-subscriber queues are bounded:
//! a subscriber that falls behind loses the oldest events and the loss is
//! counted, so producers never block.

pub mod event_bus;
pub mod scheduler;

pub use event_bus::{BusReceiver, EventBus};
pub use scheduler::Scheduler;
