//! # trustplane Trust Scorer
//!
//! Maintains the per-device trust score in [0, 100] and notifies the rest
//! of the core when a score crosses one of the configured thresholds.
//!
//! All adjustments for a device are applied atomically under a per-device
//! lock, history is append-only, and the clamp happens at every step, so
//! the current score always equals the initial value plus the sum of all
//! recorded deltas (clamped step by step).

pub mod scorer;

pub use scorer::{TrustCategory, TrustScorer};
