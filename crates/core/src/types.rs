//! Core type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Device identifier (4-64 characters, alphanumeric plus hyphens)
///
/// Auto-onboarded devices get an id derived from the MAC prefix plus a
/// random suffix; administrators may also choose one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.len() < 4 || id.len() > 64 {
            return Err("DeviceId must be 4-64 characters".to_string());
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err("DeviceId must contain only alphanumeric characters and hyphens".to_string());
        }
        Ok(Self(id))
    }

    /// Deterministic prefix from the MAC, random suffix for uniqueness
    pub fn generate(mac: &MacAddr) -> Self {
        let prefix: String = mac
            .octets()
            .iter()
            .take(3)
            .map(|b| format!("{:02x}", b))
            .collect();
        let suffix: u32 = rand::random();
        Self(format!("dev-{}-{:06x}", prefix, suffix & 0xff_ffff))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MAC address, normalized to lowercase colon-separated form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("Invalid MAC address: {}", s));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] =
                u8::from_str_radix(part, 16).map_err(|_| format!("Invalid MAC address: {}", s))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Device lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Discovered, awaiting administrator approval
    Pending,
    /// Approved, traffic observed but not yet policy-restricted
    Profiling,
    /// Baseline and policy established, under normal enforcement
    Active,
    /// Removed from the network; row retained for audit
    Revoked,
    /// Isolated after a hard failure or critical alert
    Quarantined,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Profiling => "profiling",
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Quarantined => "quarantined",
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "profiling" => Ok(Self::Profiling),
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(format!("Unknown device status: {}", other)),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport protocol observed on a flow
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Other => "other",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            _ => Ok(Self::Other),
        }
    }
}

/// A device record as held by the identity store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub mac: MacAddr,
    pub device_type: String,
    /// SHA-256 over `MAC:type:first_seen`, binding the physical identity
    pub fingerprint: String,
    /// Serial of the device's current (non-revoked) certificate, if issued
    pub cert_serial: Option<String>,
    pub status: DeviceStatus,
    pub first_seen: DateTime<Utc>,
    pub onboarded_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Persisted so the finalization watcher survives restarts
    pub profiling_started_at: Option<DateTime<Utc>>,
    /// Liveness-checked during attestation when set
    pub heartbeat_expected: bool,
}

impl Device {
    /// Compute the physical-identity fingerprint for a device
    pub fn compute_fingerprint(mac: &MacAddr, device_type: &str, first_seen: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{}", mac, device_type, first_seen.to_rfc3339()));
        hex::encode(hasher.finalize())
    }
}

/// Alert severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("Unknown severity: {}", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of anomaly or security alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Dos,
    Volume,
    NetworkScan,
    PortScan,
    AttestationFail,
    HoneypotHit,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dos => "dos",
            Self::Volume => "volume",
            Self::NetworkScan => "network_scan",
            Self::PortScan => "port_scan",
            Self::AttestationFail => "attestation_fail",
            Self::HoneypotHit => "honeypot_hit",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregated per-device flow statistics over one polling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStats {
    pub packets_per_sec: f64,
    pub bytes_per_sec: f64,
    pub unique_dst_ips: u64,
    pub unique_dst_ports: u64,
    pub protocols: BTreeSet<Protocol>,
    pub window_secs: u64,
}

impl FlowStats {
    /// A window in which the device was not observed at all
    pub fn zero(window_secs: u64) -> Self {
        Self {
            packets_per_sec: 0.0,
            bytes_per_sec: 0.0,
            unique_dst_ips: 0,
            unique_dst_ports: 0,
            protocols: BTreeSet::new(),
            window_secs,
        }
    }
}

/// A single packet summary delivered by the switch during profiling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketObservation {
    pub mac: MacAddr,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub protocol: Protocol,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub dst_ip: IpAddr,
}

/// Per-device traffic baseline, established at the end of profiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub avg_pps: f64,
    pub avg_bps: f64,
    /// Top destination IPs, at most 10
    pub dst_ips: BTreeSet<IpAddr>,
    /// Top destination ports, at most 10
    pub dst_ports: BTreeSet<u16>,
    pub protocols: BTreeSet<Protocol>,
    /// Set when fewer than the minimum packet count was observed
    pub sparse: bool,
    pub finalized_at: DateTime<Utc>,
}

impl Baseline {
    /// Fold one clean observation window into the baseline (EMA)
    pub fn ema_update(&mut self, stats: &FlowStats, alpha: f64) {
        self.avg_pps = (1.0 - alpha) * self.avg_pps + alpha * stats.packets_per_sec;
        self.avg_bps = (1.0 - alpha) * self.avg_bps + alpha * stats.bytes_per_sec;
    }
}

/// Forwarding action attached to a policy or mitigation rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    Redirect,
    Monitor,
}

impl RuleAction {
    /// Tie-break rank at equal priority: deny > redirect > monitor > allow
    pub fn restrictiveness(&self) -> u8 {
        match self {
            Self::Deny => 3,
            Self::Redirect => 2,
            Self::Monitor => 1,
            Self::Allow => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Redirect => "redirect",
            Self::Monitor => "monitor",
        }
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "redirect" => Ok(Self::Redirect),
            "monitor" => Ok(Self::Monitor),
            other => Err(format!("Unknown rule action: {}", other)),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Match predicate of a policy rule (subset of dst_ip, dst_port, protocol)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl RuleMatch {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn dst_ip(ip: IpAddr) -> Self {
        Self {
            dst_ip: Some(ip),
            ..Self::default()
        }
    }

    pub fn dst_port(port: u16) -> Self {
        Self {
            dst_port: Some(port),
            ..Self::default()
        }
    }
}

/// One rule of a per-device policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(rename = "match")]
    pub matches: RuleMatch,
    pub action: RuleAction,
    /// 0 is lowest; the terminal default-deny sits at 0
    pub priority: u32,
}

/// Ordered per-device rule list, always terminated by a default-deny
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    rules: Vec<PolicyRule>,
}

impl Policy {
    /// Build a policy from explicit rules, appending the default-deny if absent
    pub fn with_default_deny(mut rules: Vec<PolicyRule>) -> Self {
        let has_terminal_deny = rules
            .last()
            .map(|r| r.action == RuleAction::Deny && r.priority == 0 && r.matches == RuleMatch::any())
            .unwrap_or(false);
        if !has_terminal_deny {
            rules.push(PolicyRule {
                matches: RuleMatch::any(),
                action: RuleAction::Deny,
                priority: 0,
            });
        }
        Self { rules }
    }

    /// A policy that denies everything
    pub fn deny_all() -> Self {
        Self::with_default_deny(Vec::new())
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// True iff the final rule is a catch-all deny at priority 0
    pub fn ends_with_default_deny(&self) -> bool {
        self.rules
            .last()
            .map(|r| r.action == RuleAction::Deny && r.priority == 0 && r.matches == RuleMatch::any())
            .unwrap_or(false)
    }
}

/// One append-only trust history row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEvent {
    pub device_id: DeviceId,
    pub score_after: i64,
    pub delta: i64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// A severity-tagged alert; immutable once emitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub device_id: DeviceId,
    pub kind: AlertKind,
    pub severity: Severity,
    /// Stats snapshot for flow-derived alerts; absent for attestation failures
    pub observed: Option<FlowStats>,
    pub timestamp: DateTime<Utc>,
}

/// Threat intelligence extracted from honeypot logs, keyed by source IP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    pub source_ip: IpAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_kinds: BTreeSet<String>,
    pub severity: Severity,
}

/// A cross-device forwarding rule derived from confirmed threat intel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationRule {
    /// Matched source IP
    pub source_ip: IpAddr,
    pub action: RuleAction,
    pub priority: u32,
    pub reason: String,
    /// Threat table key this rule was derived from
    pub origin_threat: IpAddr,
    /// Permanent rules survive restarts; others expire with the threat
    pub permanent: bool,
}

/// Network-layer decision for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Redirect,
    Deny,
    Quarantine,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Redirect => "redirect",
            Self::Deny => "deny",
            Self::Quarantine => "quarantine",
        }
    }

    /// Rank on the degradation ladder: allow < redirect < deny < quarantine
    pub fn restriction_level(&self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::Redirect => 1,
            Self::Deny => 2,
            Self::Quarantine => 3,
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "redirect" => Ok(Self::Redirect),
            "deny" => Ok(Self::Deny),
            "quarantine" => Ok(Self::Quarantine),
            other => Err(format!("Unknown decision: {}", other)),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record produced for every orchestrator decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub device_id: DeviceId,
    pub trust: i64,
    pub threat_level: Option<Severity>,
    pub decision: Decision,
    pub reason: String,
    pub prev_decision: Option<Decision>,
    pub correlation_id: String,
}

impl AuditRecord {
    pub fn new_correlation_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
