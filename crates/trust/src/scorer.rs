//! Score bookkeeping and threshold notifications

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use trustplane_bus::EventBus;
use trustplane_core::types::{DeviceId, Severity, TrustEvent};
use trustplane_core::{Event, Result};
use trustplane_identity::IdentityStore;

/// Score bounds
const MIN_SCORE: i64 = 0;
const MAX_SCORE: i64 = 100;

/// Sources of trust adjustments; the severity→delta table lives here and
/// nowhere else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustCategory {
    BehavioralAnomaly,
    SecurityAlert,
    AttestationFail,
    HoneypotHit,
    PositiveTick,
}

impl TrustCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BehavioralAnomaly => "behavioral_anomaly",
            Self::SecurityAlert => "security_alert",
            Self::AttestationFail => "attestation_fail",
            Self::HoneypotHit => "honeypot_hit",
            Self::PositiveTick => "positive_tick",
        }
    }

    /// Severity → delta table
    pub fn delta(&self, severity: Severity) -> i64 {
        match self {
            Self::BehavioralAnomaly => match severity {
                Severity::Low => -5,
                Severity::Medium => -15,
                Severity::High | Severity::Critical => -30,
            },
            Self::SecurityAlert => match severity {
                Severity::Low => -10,
                Severity::Medium => -20,
                Severity::High | Severity::Critical => -40,
            },
            // Severity is ignored for attestation failures
            Self::AttestationFail => -20,
            Self::HoneypotHit => match severity {
                Severity::Low => -10,
                Severity::Medium => -20,
                Severity::High => -40,
                Severity::Critical => -60,
            },
            Self::PositiveTick => 2,
        }
    }
}

/// Event-driven per-device trust score
pub struct TrustScorer {
    store: Arc<IdentityStore>,
    bus: Arc<EventBus>,
    current: DashMap<DeviceId, i64>,
    /// Thresholds a device is currently below; drives hysteresis
    below: DashMap<DeviceId, BTreeSet<i64>>,
    locks: DashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>,
    thresholds: Vec<i64>,
    hysteresis: i64,
    initial: i64,
}

impl TrustScorer {
    pub fn new(
        store: Arc<IdentityStore>,
        bus: Arc<EventBus>,
        initial: i64,
        thresholds: Vec<i64>,
        hysteresis: i64,
    ) -> Self {
        Self {
            store,
            bus,
            current: DashMap::new(),
            below: DashMap::new(),
            locks: DashMap::new(),
            thresholds,
            hysteresis,
            initial,
        }
    }

    fn lock_for(&self, device_id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Set up scoring for a device; idempotent
    pub async fn initialize(&self, device_id: &DeviceId) -> Result<()> {
        let lock = self.lock_for(device_id);
        let _guard = lock.lock().await;

        if self.current.contains_key(device_id) {
            return Ok(());
        }
        self.store.init_trust_score(device_id, self.initial).await?;
        self.current.insert(device_id.clone(), self.initial);
        self.below.insert(
            device_id.clone(),
            self.thresholds
                .iter()
                .copied()
                .filter(|t| self.initial < *t)
                .collect(),
        );
        Ok(())
    }

    async fn load(&self, device_id: &DeviceId) -> Result<i64> {
        if let Some(score) = self.current.get(device_id) {
            return Ok(*score);
        }
        // Restart path: rebuild in-memory state from the store
        let score = self.store.current_trust(device_id).await?;
        self.current.insert(device_id.clone(), score);
        self.below.insert(
            device_id.clone(),
            self.thresholds
                .iter()
                .copied()
                .filter(|t| score < *t)
                .collect(),
        );
        Ok(score)
    }

    /// Apply a delta, clamped to [0, 100], appending history and publishing
    /// TrustChanged on every threshold crossing
    pub async fn adjust(&self, device_id: &DeviceId, delta: i64, reason: &str) -> Result<i64> {
        let lock = self.lock_for(device_id);
        let _guard = lock.lock().await;

        let previous = self.load(device_id).await?;
        let score = (previous + delta).clamp(MIN_SCORE, MAX_SCORE);

        self.store
            .append_trust_event(&TrustEvent {
                device_id: device_id.clone(),
                score_after: score,
                delta,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            })
            .await?;
        self.current.insert(device_id.clone(), score);

        tracing::debug!(device_id = %device_id, delta, score, reason, "trust adjusted");
        self.publish_crossings(device_id, previous, score);
        Ok(score)
    }

    /// Emit TrustChanged for every threshold crossed by this adjustment
    ///
    /// Downward crossings fire when the score falls below a threshold.
    /// Upward crossings fire only once the score reaches threshold +
    /// hysteresis, so a device hovering at the boundary does not flap.
    fn publish_crossings(&self, device_id: &DeviceId, previous: i64, score: i64) {
        let mut below = self
            .below
            .entry(device_id.clone())
            .or_insert_with(BTreeSet::new);

        for &threshold in &self.thresholds {
            if score < threshold && !below.contains(&threshold) {
                below.insert(threshold);
                self.bus.publish(Event::TrustChanged {
                    device_id: device_id.clone(),
                    score,
                    previous,
                    threshold,
                    upward: false,
                });
            } else if score >= threshold + self.hysteresis && below.contains(&threshold) {
                below.remove(&threshold);
                self.bus.publish(Event::TrustChanged {
                    device_id: device_id.clone(),
                    score,
                    previous,
                    threshold,
                    upward: true,
                });
            }
        }
    }

    /// Translate an alert into a trust delta via the category table
    pub async fn record_alert(
        &self,
        device_id: &DeviceId,
        category: TrustCategory,
        severity: Severity,
    ) -> Result<i64> {
        let delta = category.delta(severity);
        let reason = format!("{}:{}", category.as_str(), severity);
        self.adjust(device_id, delta, &reason).await
    }

    /// Fixed −20 regardless of severity
    pub async fn record_attestation_failure(&self, device_id: &DeviceId) -> Result<i64> {
        self.adjust(
            device_id,
            TrustCategory::AttestationFail.delta(Severity::High),
            TrustCategory::AttestationFail.as_str(),
        )
        .await
    }

    /// Optional +2 drift for an uneventful hour; wired only when enabled
    pub async fn record_positive_tick(&self, device_id: &DeviceId) -> Result<i64> {
        self.adjust(
            device_id,
            TrustCategory::PositiveTick.delta(Severity::Low),
            TrustCategory::PositiveTick.as_str(),
        )
        .await
    }

    pub async fn get(&self, device_id: &DeviceId) -> Result<i64> {
        let lock = self.lock_for(device_id);
        let _guard = lock.lock().await;
        self.load(device_id).await
    }

    /// Snapshot of all scores known to this process
    pub fn all_scores(&self) -> Vec<(DeviceId, i64)> {
        self.current
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
