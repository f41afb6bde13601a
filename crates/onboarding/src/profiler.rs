//! Behavioral profiling: observation accumulation and baseline computation

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use trustplane_core::types::{Baseline, DeviceId, MacAddr, PacketObservation, Protocol};

/// Destination sets in a baseline hold at most this many entries
const TOP_N: usize = 10;

/// Accumulated traffic for one profiling device
#[derive(Debug, Clone)]
struct ProfileSession {
    device_id: DeviceId,
    started_at: DateTime<Utc>,
    packets: u64,
    bytes: u64,
    dst_ip_counts: HashMap<IpAddr, u64>,
    dst_port_counts: HashMap<u16, u64>,
    protocols: BTreeSet<Protocol>,
}

/// In-memory observation accumulator, keyed by MAC
///
/// Only devices currently in the profiling window are tracked; everything
/// else flowing on the observation channel is ignored. State is rebuilt
/// (empty) after a restart, which at worst yields a sparse baseline.
pub struct ProfileCollector {
    sessions: DashMap<MacAddr, ProfileSession>,
}

impl ProfileCollector {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Begin accumulating for a device
    pub fn start(&self, device_id: DeviceId, mac: MacAddr, started_at: DateTime<Utc>) {
        self.sessions.insert(
            mac,
            ProfileSession {
                device_id,
                started_at,
                packets: 0,
                bytes: 0,
                dst_ip_counts: HashMap::new(),
                dst_port_counts: HashMap::new(),
                protocols: BTreeSet::new(),
            },
        );
    }

    pub fn is_tracking(&self, mac: &MacAddr) -> bool {
        self.sessions.contains_key(mac)
    }

    /// Fold one observation in; returns the owning device id when tracked
    pub fn observe(&self, observation: &PacketObservation) -> Option<DeviceId> {
        let mut session = self.sessions.get_mut(&observation.mac)?;
        session.packets += 1;
        session.bytes += observation.size;
        *session
            .dst_ip_counts
            .entry(observation.dst_ip)
            .or_insert(0) += 1;
        if let Some(port) = observation.dst_port {
            *session.dst_port_counts.entry(port).or_insert(0) += 1;
        }
        session.protocols.insert(observation.protocol);
        Some(session.device_id.clone())
    }

    /// Observation count so far, if tracked
    pub fn packet_count(&self, mac: &MacAddr) -> Option<u64> {
        self.sessions.get(mac).map(|s| s.packets)
    }

    /// Close the session and compute the baseline
    ///
    /// Rates are averaged over the elapsed window (floored at one second).
    /// A session below `min_packets` still yields a baseline, marked
    /// sparse. An untracked MAC (restart mid-window) yields an empty
    /// sparse baseline.
    pub fn finalize(&self, mac: &MacAddr, min_packets: u64) -> Baseline {
        let session = self.sessions.remove(mac).map(|(_, s)| s);
        let now = Utc::now();

        let (session, elapsed_secs) = match session {
            Some(s) => {
                let elapsed = (now - s.started_at).num_seconds().max(1) as f64;
                (s, elapsed)
            }
            None => {
                return Baseline {
                    avg_pps: 0.0,
                    avg_bps: 0.0,
                    dst_ips: BTreeSet::new(),
                    dst_ports: BTreeSet::new(),
                    protocols: BTreeSet::new(),
                    sparse: true,
                    finalized_at: now,
                }
            }
        };

        Baseline {
            avg_pps: session.packets as f64 / elapsed_secs,
            avg_bps: session.bytes as f64 / elapsed_secs,
            dst_ips: top_n(&session.dst_ip_counts),
            dst_ports: top_n(&session.dst_port_counts),
            protocols: session.protocols,
            sparse: session.packets < min_packets,
            finalized_at: now,
        }
    }

    /// Drop a session without producing a baseline (revocation mid-window)
    pub fn abort(&self, mac: &MacAddr) {
        self.sessions.remove(mac);
    }
}

impl Default for ProfileCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Most-observed keys, capped at TOP_N
fn top_n<K: Copy + Ord>(counts: &HashMap<K, u64>) -> BTreeSet<K> {
    let mut entries: Vec<_> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1));
    entries.into_iter().take(TOP_N).map(|(k, _)| *k).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddr {
        "aa:bb:cc:00:00:01".parse().unwrap()
    }

    fn observation(dst_ip: &str, dst_port: u16, size: u64) -> PacketObservation {
        PacketObservation {
            mac: mac(),
            timestamp: Utc::now(),
            size,
            protocol: Protocol::Tcp,
            src_port: Some(50000),
            dst_port: Some(dst_port),
            dst_ip: dst_ip.parse().unwrap(),
        }
    }

    #[test]
    fn test_untracked_mac_ignored() {
        let collector = ProfileCollector::new();
        assert!(collector.observe(&observation("10.0.0.10", 443, 100)).is_none());
    }

    #[test]
    fn test_accumulation_and_finalize() {
        let collector = ProfileCollector::new();
        let id = DeviceId::new("iot-cam-01").unwrap();
        collector.start(id.clone(), mac(), Utc::now() - chrono::Duration::seconds(100));

        for _ in 0..100 {
            let owner = collector.observe(&observation("10.0.0.10", 443, 120));
            assert_eq!(owner, Some(id.clone()));
        }
        assert_eq!(collector.packet_count(&mac()), Some(100));

        let baseline = collector.finalize(&mac(), 5);
        assert!(!baseline.sparse);
        assert!(baseline.avg_pps > 0.0);
        assert!(baseline.avg_bps > 0.0);
        assert_eq!(baseline.dst_ips, BTreeSet::from(["10.0.0.10".parse().unwrap()]));
        assert_eq!(baseline.dst_ports, BTreeSet::from([443]));
        assert_eq!(baseline.protocols, BTreeSet::from([Protocol::Tcp]));
        // Session is consumed
        assert!(!collector.is_tracking(&mac()));
    }

    #[test]
    fn test_sparse_baseline_below_min_packets() {
        let collector = ProfileCollector::new();
        collector.start(
            DeviceId::new("iot-cam-01").unwrap(),
            mac(),
            Utc::now() - chrono::Duration::seconds(300),
        );
        collector.observe(&observation("10.0.0.10", 443, 100));

        let baseline = collector.finalize(&mac(), 5);
        assert!(baseline.sparse);
        assert_eq!(baseline.dst_ips.len(), 1);
    }

    #[test]
    fn test_finalize_untracked_yields_empty_sparse() {
        let collector = ProfileCollector::new();
        let baseline = collector.finalize(&mac(), 5);
        assert!(baseline.sparse);
        assert!(baseline.dst_ips.is_empty());
        assert_eq!(baseline.avg_pps, 0.0);
    }

    #[test]
    fn test_top_n_caps_destinations() {
        let collector = ProfileCollector::new();
        collector.start(
            DeviceId::new("iot-cam-01").unwrap(),
            mac(),
            Utc::now() - chrono::Duration::seconds(60),
        );

        // 15 distinct destination IPs; the busiest 10 survive
        for i in 0..15u8 {
            let ip = format!("10.0.1.{}", i);
            // Heavier traffic on lower-numbered destinations
            for _ in 0..(20 - i as u64) {
                collector.observe(&observation(&ip, 1000 + i as u16, 60));
            }
        }

        let baseline = collector.finalize(&mac(), 5);
        assert_eq!(baseline.dst_ips.len(), 10);
        assert_eq!(baseline.dst_ports.len(), 10);
        assert!(baseline.dst_ips.contains(&"10.0.1.0".parse().unwrap()));
        assert!(!baseline.dst_ips.contains(&"10.0.1.14".parse().unwrap()));
    }

    #[test]
    fn test_abort_discards_session() {
        let collector = ProfileCollector::new();
        collector.start(DeviceId::new("iot-cam-01").unwrap(), mac(), Utc::now());
        collector.observe(&observation("10.0.0.10", 443, 100));
        collector.abort(&mac());
        assert!(!collector.is_tracking(&mac()));
    }
}
