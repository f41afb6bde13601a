//! Switch-control trait and rule model

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use tokio::sync::broadcast;
use trustplane_core::types::{MacAddr, PacketObservation, Protocol};
use trustplane_core::Result;

/// Stable identifier for an installed forwarding rule
///
/// Callers choose ids deterministically (for example
/// `dev:<device_id>:policy:3` or `mit:<src_ip>`) so re-installs replace
/// rather than duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Match fields understood by the switch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_src: Option<MacAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl FlowMatch {
    pub fn eth_src(mac: MacAddr) -> Self {
        Self {
            eth_src: Some(mac),
            ..Self::default()
        }
    }

    pub fn src_ip(ip: IpAddr) -> Self {
        Self {
            src_ip: Some(ip),
            ..Self::default()
        }
    }
}

/// What the switch does with matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardAction {
    /// Normal forwarding
    Normal,
    /// Drop matching packets
    Drop,
    /// Send matching packets out a fixed port (honeypot redirect)
    Output { port: u32 },
    /// Forward normally but log matches
    Monitor,
}

/// One forwarding rule as installed on the switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: RuleId,
    pub matches: FlowMatch,
    pub action: ForwardAction,
    pub priority: u32,
}

/// Outcome of an install attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Transient; the caller may retry
    Retry,
    /// The switch refused the rule; retrying is pointless
    Fatal(String),
}

/// Aggregated per-device counters for one polling window
///
/// `packets` and `bytes` are cumulative counters; the flow poller computes
/// deltas. The unique-destination sets and protocol set describe the
/// current window only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFlowSample {
    pub mac: MacAddr,
    pub packets: u64,
    pub bytes: u64,
    pub dst_ips: BTreeSet<IpAddr>,
    pub dst_ports: BTreeSet<u16>,
    pub protocols: BTreeSet<Protocol>,
    pub window_secs: u64,
}

/// Abstract control surface over one or more programmable switches
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Install (or replace, by id) a forwarding rule
    async fn install_rule(&self, rule: ForwardingRule) -> Result<InstallOutcome>;

    /// Remove a rule; unknown ids are not an error
    async fn remove_rule(&self, rule_id: &RuleId) -> Result<()>;

    /// Rules currently installed
    async fn list_rules(&self) -> Result<Vec<ForwardingRule>>;

    /// Per-device aggregated flow counters across all known switches
    async fn flow_stats(&self) -> Result<Vec<DeviceFlowSample>>;

    /// Per-packet observation stream (populated while observation rules
    /// are installed, i.e. during profiling)
    fn observations(&self) -> broadcast::Receiver<PacketObservation>;
}
