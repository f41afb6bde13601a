//! Periodic attestation of active devices
//!
//! Three checks per cycle, all of which must pass: the certificate still
//! validates, the device has been seen within two intervals, and
//! heartbeat-expected devices showed packet activity in the last interval.
//! Partial failure is failure.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use trustplane_bus::{BusReceiver, EventBus};
use trustplane_core::types::{Alert, AlertKind, Device, DeviceId, DeviceStatus, Severity};
use trustplane_core::Event;
use trustplane_ca::CertificateAuthority;
use trustplane_identity::IdentityStore;
use trustplane_trust::TrustScorer;

/// Periodic certificate and liveness verifier
pub struct AttestationLoop {
    store: Arc<IdentityStore>,
    ca: Arc<CertificateAuthority>,
    trust: Arc<TrustScorer>,
    bus: Arc<EventBus>,
    /// Packets/sec observed in the most recent flow window, per device
    recent_activity: DashMap<DeviceId, f64>,
    interval: Duration,
}

impl AttestationLoop {
    pub fn new(
        store: Arc<IdentityStore>,
        ca: Arc<CertificateAuthority>,
        trust: Arc<TrustScorer>,
        bus: Arc<EventBus>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            ca,
            trust,
            bus,
            recent_activity: DashMap::new(),
            interval,
        }
    }

    /// Long-lived worker: attest on a cadence while tracking flow activity
    pub async fn run(self: Arc<Self>, mut receiver: BusReceiver) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.attest_all().await;
                }
                event = receiver.recv() => {
                    match event {
                        Some(Event::FlowSample { device_id, stats }) => {
                            self.recent_activity.insert(device_id, stats.packets_per_sec);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    }

    /// One attestation sweep over all active devices
    pub async fn attest_all(&self) {
        let devices = match self.store.list_by_status(DeviceStatus::Active).await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "attestation sweep could not list devices");
                return;
            }
        };

        for device in devices {
            if let Some(reason) = self.check_device(&device).await {
                self.report_failure(&device.id, &reason).await;
            }
        }
    }

    /// Returns a failure description, or None when all checks pass
    async fn check_device(&self, device: &Device) -> Option<String> {
        // (a) certificate validity
        let cert = match self.ca.device_cert_pem(&device.id).await {
            Ok(pem) => pem,
            Err(_) => return Some("certificate missing".to_string()),
        };
        if let Err(e) = self.ca.validate(&cert, &device.id, &device.mac).await {
            return Some(format!("certificate invalid: {}", e));
        }

        // (b) seen recently
        let horizon = ChronoDuration::seconds(2 * self.interval.as_secs() as i64);
        match device.last_seen {
            Some(last_seen) if Utc::now() - last_seen <= horizon => {}
            _ => return Some("device silent past liveness horizon".to_string()),
        }

        // (c) heartbeat-expected devices must show packet activity
        if device.heartbeat_expected {
            let pps = self
                .recent_activity
                .get(&device.id)
                .map(|v| *v)
                .unwrap_or(0.0);
            if pps <= 0.0 {
                return Some("no packet activity in last interval".to_string());
            }
        }

        None
    }

    async fn report_failure(&self, device_id: &DeviceId, reason: &str) {
        tracing::warn!(device_id = %device_id, reason, "attestation failed");

        if let Err(e) = self.trust.record_attestation_failure(device_id).await {
            tracing::error!(device_id = %device_id, error = %e, "trust adjustment failed");
        }

        self.bus.publish(Event::AlertRaised(Alert {
            device_id: device_id.clone(),
            kind: AlertKind::AttestationFail,
            severity: Severity::Medium,
            observed: None,
            timestamp: Utc::now(),
        }));
    }

    /// Record flow activity directly; used when run() is not driving
    pub fn note_activity(&self, device_id: DeviceId, packets_per_sec: f64) {
        self.recent_activity.insert(device_id, packets_per_sec);
    }
}
