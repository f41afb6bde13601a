//! # trustplane Identity Store
//!
//! Durable, single-file store for everything the policy core must remember
//! across restarts: device records, trust history, baselines, policies,
//! threat intelligence, mitigation rules, and the decision audit log.
//!
//! The store exclusively owns these rows; other components read and mutate
//! them only through this interface. All state-changing operations are
//! atomic per device, and concurrent writers to the same device are
//! serialized by a per-device lock.

pub mod migrations;
pub mod store;

pub use store::{IdentityStore, PendingDevice};
