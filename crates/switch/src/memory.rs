//! In-memory switch implementation
//!
//! Serves two roles: the null implementation the core falls back to when
//! no real switch is configured, and the test double used throughout the
//! workspace. Installed rules, flow samples, and observations are all
//! driven explicitly.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use trustplane_core::types::{MacAddr, PacketObservation};
use trustplane_core::{Error, Result};

use crate::adapter::{
    DeviceFlowSample, ForwardingRule, InstallOutcome, RuleId, SwitchControl,
};

const OBSERVATION_CHANNEL_CAPACITY: usize = 1024;

/// Rule table plus injectable failure behavior
pub struct InMemorySwitch {
    rules: DashMap<RuleId, ForwardingRule>,
    samples: Mutex<Vec<DeviceFlowSample>>,
    observations: broadcast::Sender<PacketObservation>,
    /// Fail this many upcoming installs with Retry
    retry_installs: AtomicU64,
    /// When set, every call fails with SwitchUnavailable
    unavailable: AtomicBool,
    install_count: AtomicU64,
    /// Install log for assertions on idempotency
    install_log: Mutex<Vec<RuleId>>,
}

impl InMemorySwitch {
    pub fn new() -> Self {
        let (observations, _) = broadcast::channel(OBSERVATION_CHANNEL_CAPACITY);
        Self {
            rules: DashMap::new(),
            samples: Mutex::new(Vec::new()),
            observations,
            retry_installs: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            install_count: AtomicU64::new(0),
            install_log: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a disconnected switch
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `n` installs return Retry
    pub fn fail_next_installs(&self, n: u64) {
        self.retry_installs.store(n, Ordering::SeqCst);
    }

    /// Replace the flow sample set returned by `flow_stats`
    pub fn set_flow_samples(&self, samples: Vec<DeviceFlowSample>) {
        *self.samples.lock().unwrap() = samples;
    }

    /// Feed one profiling observation to subscribers
    pub fn inject_observation(&self, observation: PacketObservation) {
        let _ = self.observations.send(observation);
    }

    /// Total successful installs since construction
    pub fn install_count(&self) -> u64 {
        self.install_count.load(Ordering::SeqCst)
    }

    /// Ids of every successful install, in order
    pub fn install_log(&self) -> Vec<RuleId> {
        self.install_log.lock().unwrap().clone()
    }

    /// Installed rules whose match references the given MAC
    pub fn rules_for_mac(&self, mac: &MacAddr) -> Vec<ForwardingRule> {
        self.rules
            .iter()
            .filter(|entry| entry.value().matches.eth_src.as_ref() == Some(mac))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn rule(&self, id: &RuleId) -> Option<ForwardingRule> {
        self.rules.get(id).map(|r| r.clone())
    }
}

impl Default for InMemorySwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SwitchControl for InMemorySwitch {
    async fn install_rule(&self, rule: ForwardingRule) -> Result<InstallOutcome> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::SwitchUnavailable);
        }
        if self.retry_installs.load(Ordering::SeqCst) > 0 {
            self.retry_installs.fetch_sub(1, Ordering::SeqCst);
            return Ok(InstallOutcome::Retry);
        }

        self.install_count.fetch_add(1, Ordering::SeqCst);
        self.install_log.lock().unwrap().push(rule.id.clone());
        self.rules.insert(rule.id.clone(), rule);
        Ok(InstallOutcome::Installed)
    }

    async fn remove_rule(&self, rule_id: &RuleId) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::SwitchUnavailable);
        }
        self.rules.remove(rule_id);
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<ForwardingRule>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::SwitchUnavailable);
        }
        Ok(self.rules.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn flow_stats(&self) -> Result<Vec<DeviceFlowSample>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::SwitchUnavailable);
        }
        Ok(self.samples.lock().unwrap().clone())
    }

    fn observations(&self) -> broadcast::Receiver<PacketObservation> {
        self.observations.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{FlowMatch, ForwardAction};
    use chrono::Utc;
    use trustplane_core::types::Protocol;

    fn rule(id: &str, mac: &str) -> ForwardingRule {
        ForwardingRule {
            id: RuleId::new(id),
            matches: FlowMatch::eth_src(mac.parse().unwrap()),
            action: ForwardAction::Drop,
            priority: 200,
        }
    }

    #[tokio::test]
    async fn test_install_and_list() {
        let switch = InMemorySwitch::new();
        let outcome = switch
            .install_rule(rule("r1", "aa:bb:cc:00:00:01"))
            .await
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(switch.list_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_install_same_id_replaces() {
        let switch = InMemorySwitch::new();
        switch
            .install_rule(rule("r1", "aa:bb:cc:00:00:01"))
            .await
            .unwrap();
        let mut replacement = rule("r1", "aa:bb:cc:00:00:01");
        replacement.priority = 65535;
        switch.install_rule(replacement).await.unwrap();

        let rules = switch.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 65535);
        assert_eq!(switch.install_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_ok() {
        let switch = InMemorySwitch::new();
        switch.remove_rule(&RuleId::new("ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_propagates() {
        let switch = InMemorySwitch::new();
        switch.set_unavailable(true);
        let err = switch
            .install_rule(rule("r1", "aa:bb:cc:00:00:01"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SwitchUnavailable));
        assert!(switch.list_rules().await.is_err());
    }

    #[tokio::test]
    async fn test_retry_injection() {
        let switch = InMemorySwitch::new();
        switch.fail_next_installs(2);
        assert_eq!(
            switch
                .install_rule(rule("r1", "aa:bb:cc:00:00:01"))
                .await
                .unwrap(),
            InstallOutcome::Retry
        );
        assert_eq!(
            switch
                .install_rule(rule("r1", "aa:bb:cc:00:00:01"))
                .await
                .unwrap(),
            InstallOutcome::Retry
        );
        assert_eq!(
            switch
                .install_rule(rule("r1", "aa:bb:cc:00:00:01"))
                .await
                .unwrap(),
            InstallOutcome::Installed
        );
    }

    #[tokio::test]
    async fn test_observation_stream() {
        let switch = InMemorySwitch::new();
        let mut rx = switch.observations();
        switch.inject_observation(PacketObservation {
            mac: "aa:bb:cc:00:00:01".parse().unwrap(),
            timestamp: Utc::now(),
            size: 120,
            protocol: Protocol::Tcp,
            src_port: Some(51514),
            dst_port: Some(443),
            dst_ip: "10.0.0.10".parse().unwrap(),
        });

        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.dst_port, Some(443));
        assert_eq!(obs.size, 120);
    }

    #[tokio::test]
    async fn test_rules_for_mac() {
        let switch = InMemorySwitch::new();
        switch
            .install_rule(rule("r1", "aa:bb:cc:00:00:01"))
            .await
            .unwrap();
        switch
            .install_rule(rule("r2", "aa:bb:cc:00:00:02"))
            .await
            .unwrap();

        let mac: MacAddr = "aa:bb:cc:00:00:01".parse().unwrap();
        let rules = switch.rules_for_mac(&mac);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, RuleId::new("r1"));
    }
}
