//! Event definitions for the shared event bus

use crate::types::{
    Alert, DeviceId, DeviceStatus, FlowStats, MitigationRule, Severity,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Events exchanged between trustplane workers
///
/// Every event that re-enters the Traffic Orchestrator names the device(s)
/// it affects, either directly or via a source IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Device lifecycle transition
    DeviceStatusChanged {
        device_id: DeviceId,
        old_status: DeviceStatus,
        new_status: DeviceStatus,
    },

    /// Trust score crossed a threshold
    TrustChanged {
        device_id: DeviceId,
        score: i64,
        previous: i64,
        threshold: i64,
        upward: bool,
    },

    /// Per-device flow statistics for one polling window
    FlowSample {
        device_id: DeviceId,
        stats: FlowStats,
    },

    /// Anomaly, attestation, or honeypot alert
    AlertRaised(Alert),

    /// Honeypot-derived threat created or escalated
    ThreatUpdated { source_ip: IpAddr, severity: Severity },

    /// Threat aged out; non-permanent mitigations expire with it
    ThreatExpired { source_ip: IpAddr },

    /// A device's stored policy was replaced
    PolicyReplaced { device_id: DeviceId },

    /// Mitigation rule submitted for installation
    MitigationProposed(MitigationRule),

    /// Operator attention required (exhausted retries, switch loss)
    OperatorAlert {
        device_id: Option<DeviceId>,
        message: String,
    },
}

impl Event {
    /// The device this event is scoped to, when there is one
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::DeviceStatusChanged { device_id, .. }
            | Self::TrustChanged { device_id, .. }
            | Self::FlowSample { device_id, .. }
            | Self::PolicyReplaced { device_id } => Some(device_id),
            Self::AlertRaised(alert) => Some(&alert.device_id),
            Self::OperatorAlert { device_id, .. } => device_id.as_ref(),
            Self::ThreatUpdated { .. } | Self::ThreatExpired { .. } | Self::MitigationProposed(_) => {
                None
            }
        }
    }
}
