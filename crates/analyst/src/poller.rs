//! Flow statistics polling
//!
//! Polls the switch adapter on a fixed cadence, converts cumulative
//! counters into per-second rates, and publishes one `FlowSample` per
//! known device per window. Devices absent from the switch's answer get a
//! zero sample; a missing switch is not an error.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use trustplane_bus::EventBus;
use trustplane_core::types::{DeviceStatus, FlowStats, MacAddr};
use trustplane_core::Event;
use trustplane_identity::IdentityStore;
use trustplane_switch::SwitchControl;

/// Last cumulative counters seen for a device
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    packets: u64,
    bytes: u64,
}

/// Periodic flow-counter poller
pub struct FlowPoller {
    store: Arc<IdentityStore>,
    switch: Arc<dyn SwitchControl>,
    bus: Arc<EventBus>,
    last: DashMap<MacAddr, Counters>,
    window_secs: u64,
}

impl FlowPoller {
    pub fn new(
        store: Arc<IdentityStore>,
        switch: Arc<dyn SwitchControl>,
        bus: Arc<EventBus>,
        window_secs: u64,
    ) -> Self {
        Self {
            store,
            switch,
            bus,
            last: DashMap::new(),
            window_secs: window_secs.max(1),
        }
    }

    /// One polling pass
    pub async fn poll_once(&self) {
        let samples = match self.switch.flow_stats().await {
            Ok(samples) => samples,
            Err(e) => {
                // Not an error condition for the poller; the orchestrator
                // learns about a dead switch through its own installs
                tracing::debug!(error = %e, "flow poll returned nothing");
                Vec::new()
            }
        };

        let mut seen: HashSet<MacAddr> = HashSet::new();

        for sample in samples {
            seen.insert(sample.mac);

            let device = match self.store.get_device_by_mac(&sample.mac).await {
                Ok(Some(device)) => device,
                // Unknown MACs on the switch are the gateway's problem
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "device lookup failed during flow poll");
                    continue;
                }
            };

            let window = if sample.window_secs > 0 {
                sample.window_secs
            } else {
                self.window_secs
            };

            let previous = self
                .last
                .insert(
                    sample.mac,
                    Counters {
                        packets: sample.packets,
                        bytes: sample.bytes,
                    },
                )
                .unwrap_or_default();

            let delta_packets = sample.packets.saturating_sub(previous.packets);
            let delta_bytes = sample.bytes.saturating_sub(previous.bytes);

            if delta_packets > 0 {
                if let Err(e) = self
                    .store
                    .set_last_seen(&device.id, chrono::Utc::now())
                    .await
                {
                    tracing::warn!(device_id = %device.id, error = %e, "failed to record last_seen");
                }
            }

            let stats = FlowStats {
                packets_per_sec: delta_packets as f64 / window as f64,
                bytes_per_sec: delta_bytes as f64 / window as f64,
                unique_dst_ips: sample.dst_ips.len() as u64,
                unique_dst_ports: sample.dst_ports.len() as u64,
                protocols: sample.protocols,
                window_secs: window,
            };

            self.bus.publish(Event::FlowSample {
                device_id: device.id,
                stats,
            });
        }

        // Devices the switch did not mention were silent this window
        let active = match self.store.list_by_status(DeviceStatus::Active).await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!(error = %e, "device list failed during flow poll");
                return;
            }
        };
        for device in active {
            if !seen.contains(&device.mac) {
                self.bus.publish(Event::FlowSample {
                    device_id: device.id,
                    stats: FlowStats::zero(self.window_secs),
                });
            }
        }
    }
}
