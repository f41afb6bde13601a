//! Baseline comparison rules and the anomaly detection worker

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trustplane_bus::{BusReceiver, EventBus};
use trustplane_core::types::{Alert, AlertKind, Baseline, DeviceId, FlowStats, Severity};
use trustplane_core::Event;
use trustplane_identity::IdentityStore;
use trustplane_trust::{TrustCategory, TrustScorer};

/// Ratio thresholds for the DoS rule (pps vs baseline)
const DOS_HIGH_RATIO: f64 = 10.0;
const DOS_MEDIUM_RATIO: f64 = 5.0;
const DOS_LOW_RATIO: f64 = 2.0;
/// Volume rule (bps vs baseline)
const VOLUME_RATIO: f64 = 10.0;
/// Network scan: ratio plus absolute floor
const NETSCAN_RATIO: f64 = 5.0;
const NETSCAN_FLOOR: u64 = 20;
/// Port scan: ratio plus absolute floor
const PORTSCAN_RATIO: f64 = 3.0;
const PORTSCAN_FLOOR: u64 = 10;

/// A baseline value of zero would make every ratio infinite
fn floor_one(value: f64) -> f64 {
    if value <= 0.0 {
        1.0
    } else {
        value
    }
}

/// Apply the four anomaly rules to one window
///
/// Returns every (kind, severity) pair that fired; rate limiting is the
/// caller's concern.
pub fn evaluate_window(stats: &FlowStats, baseline: &Baseline) -> Vec<(AlertKind, Severity)> {
    let mut fired = Vec::new();

    let baseline_pps = floor_one(baseline.avg_pps);
    if stats.packets_per_sec >= DOS_HIGH_RATIO * baseline_pps {
        fired.push((AlertKind::Dos, Severity::High));
    } else if stats.packets_per_sec >= DOS_MEDIUM_RATIO * baseline_pps {
        fired.push((AlertKind::Dos, Severity::Medium));
    } else if stats.packets_per_sec >= DOS_LOW_RATIO * baseline_pps {
        fired.push((AlertKind::Dos, Severity::Low));
    }

    let baseline_bps = floor_one(baseline.avg_bps);
    if stats.bytes_per_sec >= VOLUME_RATIO * baseline_bps {
        fired.push((AlertKind::Volume, Severity::High));
    }

    let baseline_ips = floor_one(baseline.dst_ips.len() as f64);
    if stats.unique_dst_ips as f64 >= NETSCAN_RATIO * baseline_ips
        && stats.unique_dst_ips >= NETSCAN_FLOOR
    {
        fired.push((AlertKind::NetworkScan, Severity::Medium));
    }

    let baseline_ports = floor_one(baseline.dst_ports.len() as f64);
    if stats.unique_dst_ports as f64 >= PORTSCAN_RATIO * baseline_ports
        && stats.unique_dst_ports >= PORTSCAN_FLOOR
    {
        fired.push((AlertKind::PortScan, Severity::Medium));
    }

    fired
}

/// Flow-sample consumer that raises alerts and adapts baselines
pub struct AnomalyDetector {
    store: Arc<IdentityStore>,
    trust: Arc<TrustScorer>,
    bus: Arc<EventBus>,
    /// Last fire time per device and rule; enforces the anomaly window
    last_fired: DashMap<(DeviceId, AlertKind), Instant>,
    anomaly_window: Duration,
    ema_alpha: f64,
}

impl AnomalyDetector {
    pub fn new(
        store: Arc<IdentityStore>,
        trust: Arc<TrustScorer>,
        bus: Arc<EventBus>,
        anomaly_window: Duration,
        ema_alpha: f64,
    ) -> Self {
        Self {
            store,
            trust,
            bus,
            last_fired: DashMap::new(),
            anomaly_window,
            ema_alpha,
        }
    }

    /// Long-lived worker: consume flow samples from the bus
    pub async fn run(self: Arc<Self>, mut receiver: BusReceiver) {
        while let Some(event) = receiver.recv().await {
            if let Event::FlowSample { device_id, stats } = event {
                self.handle_sample(&device_id, &stats).await;
            }
        }
    }

    /// Process one flow sample; exposed for tests and direct wiring
    pub async fn handle_sample(&self, device_id: &DeviceId, stats: &FlowStats) {
        // No baseline yet (still profiling): nothing to compare against
        let mut baseline = match self.store.get_baseline(device_id).await {
            Ok(Some(baseline)) => baseline,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "baseline fetch failed");
                return;
            }
        };

        let fired = evaluate_window(stats, &baseline);
        let mut emitted = false;

        for (kind, severity) in fired {
            if !self.should_fire(device_id, kind) {
                continue;
            }
            emitted = true;

            tracing::warn!(
                device_id = %device_id,
                kind = %kind,
                severity = %severity,
                pps = stats.packets_per_sec,
                unique_dst_ports = stats.unique_dst_ports,
                "anomaly detected"
            );

            if let Err(e) = self
                .trust
                .record_alert(device_id, TrustCategory::BehavioralAnomaly, severity)
                .await
            {
                tracing::error!(device_id = %device_id, error = %e, "trust adjustment failed");
            }

            self.bus.publish(Event::AlertRaised(Alert {
                device_id: device_id.clone(),
                kind,
                severity,
                observed: Some(stats.clone()),
                timestamp: Utc::now(),
            }));
        }

        // Learn only from clean windows; attack traffic must not shift
        // the baseline
        if !emitted {
            baseline.ema_update(stats, self.ema_alpha);
            if let Err(e) = self.store.put_baseline(device_id, &baseline).await {
                tracing::warn!(device_id = %device_id, error = %e, "baseline update failed");
            }
        }
    }

    /// At most one fire per rule per device per anomaly window
    fn should_fire(&self, device_id: &DeviceId, kind: AlertKind) -> bool {
        let key = (device_id.clone(), kind);
        let now = Instant::now();
        match self.last_fired.get(&key) {
            Some(last) if now.duration_since(*last) < self.anomaly_window => false,
            _ => {
                self.last_fired.insert(key, now);
                true
            }
        }
    }
}
