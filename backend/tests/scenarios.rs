//! End-to-end scenarios across the assembled core
//!
//! Components are wired exactly as the daemon wires them, but bus events
//! are pumped into the orchestrator by hand so each scenario is
//! deterministic.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use trustplane_analyst::{AnomalyDetector, AttestationLoop};
use trustplane_bus::{BusReceiver, EventBus};
use trustplane_ca::CertificateAuthority;
use trustplane_core::types::{
    Decision, DeviceId, DeviceStatus, FlowStats, MacAddr, PacketObservation, Protocol,
};
use trustplane_core::Event;
use trustplane_deception::{HoneypotIngestor, MitigationGenerator};
use trustplane_identity::IdentityStore;
use trustplane_onboarding::OnboardingCoordinator;
use trustplane_orchestrator::TrafficOrchestrator;
use trustplane_switch::{ForwardAction, InMemorySwitch, RuleId, SwitchControl};
use trustplane_trust::TrustScorer;

struct Core {
    store: Arc<IdentityStore>,
    bus: Arc<EventBus>,
    switch: Arc<InMemorySwitch>,
    ca: Arc<CertificateAuthority>,
    coordinator: Arc<OnboardingCoordinator>,
    orchestrator: Arc<TrafficOrchestrator>,
    detector: Arc<AnomalyDetector>,
    attestation: Arc<AttestationLoop>,
    generator: Arc<MitigationGenerator>,
    events: BusReceiver,
    _ca_dir: tempfile::TempDir,
}

fn core() -> Core {
    let store = Arc::new(IdentityStore::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new(1024));
    let events = bus.subscribe();
    let switch = Arc::new(InMemorySwitch::new());
    let switch_dyn = Arc::clone(&switch) as Arc<dyn SwitchControl>;
    let ca_dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(CertificateAuthority::init_or_load_root(ca_dir.path()).unwrap());
    let trust = Arc::new(TrustScorer::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        70,
        vec![70, 50, 30],
        5,
    ));
    let coordinator = Arc::new(OnboardingCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&ca),
        Arc::clone(&trust),
        Arc::clone(&switch_dyn),
        Arc::clone(&bus),
        Duration::from_secs(300),
        5,
    ));
    let orchestrator = Arc::new(TrafficOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&switch_dyn),
        300,
        600,
        Some(7),
    ));
    let detector = Arc::new(AnomalyDetector::new(
        Arc::clone(&store),
        Arc::clone(&trust),
        Arc::clone(&bus),
        Duration::from_secs(60),
        0.1,
    ));
    let attestation = Arc::new(AttestationLoop::new(
        Arc::clone(&store),
        Arc::clone(&ca),
        Arc::clone(&trust),
        Arc::clone(&bus),
        Duration::from_secs(300),
    ));
    let generator = Arc::new(MitigationGenerator::new(Arc::clone(&bus)));

    Core {
        store,
        bus,
        switch,
        ca,
        coordinator,
        orchestrator,
        detector,
        attestation,
        generator,
        events,
        _ca_dir: ca_dir,
    }
}

impl Core {
    /// Deliver every queued bus event to the orchestrator, as the run
    /// loop would; mitigation proposals are generated in line
    async fn pump(&mut self) {
        // Cap iterations: handling events can publish more events
        for _ in 0..16 {
            let mut any = false;
            while let Some(event) = self.events.try_recv() {
                any = true;
                if let Event::ThreatUpdated {
                    source_ip,
                    severity,
                } = &event
                {
                    self.generator.propose(*source_ip, *severity);
                }
                self.orchestrator.handle_event(event).await;
            }
            if !any {
                break;
            }
        }
    }

    async fn onboard_d1(&mut self) -> DeviceId {
        let mac: MacAddr = "aa:bb:cc:00:00:01".parse().unwrap();
        let id = self
            .coordinator
            .register_discovered(mac, "camera", None)
            .await
            .unwrap();
        self.coordinator.approve_device(&id, "admin ok").await.unwrap();

        for _ in 0..100 {
            self.coordinator
                .ingest_observation(&PacketObservation {
                    mac,
                    timestamp: Utc::now(),
                    size: 120,
                    protocol: Protocol::Tcp,
                    src_port: Some(50000),
                    dst_port: Some(443),
                    dst_ip: "10.0.0.10".parse().unwrap(),
                })
                .await;
        }

        self.coordinator.finalize_device(&id).await.unwrap();
        self.pump().await;
        id
    }
}

fn flow(pps: f64, ports: u64) -> FlowStats {
    FlowStats {
        packets_per_sec: pps,
        bytes_per_sec: pps * 120.0,
        unique_dst_ips: 1,
        unique_dst_ports: ports,
        protocols: BTreeSet::from([Protocol::Tcp]),
        window_secs: 10,
    }
}

#[tokio::test]
async fn s1_happy_onboarding() {
    let mut core = core();
    let id = core.onboard_d1().await;

    let device = core.store.get_device(&id).await.unwrap();
    assert_eq!(device.status, DeviceStatus::Active);

    let baseline = core.store.get_baseline(&id).await.unwrap().unwrap();
    assert!(baseline.avg_bps > 0.0);
    assert_eq!(baseline.dst_ips, BTreeSet::from(["10.0.0.10".parse().unwrap()]));
    assert_eq!(baseline.dst_ports, BTreeSet::from([443]));

    let policy = core.store.get_policy(&id).await.unwrap().unwrap();
    let rules = policy.rules();
    assert_eq!(rules.len(), 3);
    assert!(policy.ends_with_default_deny());

    assert_eq!(core.store.current_trust(&id).await.unwrap(), 70);
    assert_eq!(
        core.orchestrator.current_decision(&id),
        Some(Decision::Allow)
    );

    // The stored policy is on the switch, scoped to the device MAC
    let mac: MacAddr = "aa:bb:cc:00:00:01".parse().unwrap();
    assert_eq!(core.switch.rules_for_mac(&mac).len(), 3);
}

#[tokio::test]
async fn s2_port_scan_degrades_to_redirect_then_deny() {
    let mut core = core();
    let id = core.onboard_d1().await;

    // Port scan window: 15 unique destination ports against a baseline
    // of one
    core.detector.handle_sample(&id, &flow(1.0, 15)).await;
    core.pump().await;

    // Behavioral medium: trust 70 → 55. The medium alert is in the alert
    // window, so the decision lands on DENY first; once the alert ages
    // out the trust-only view is REDIRECT. Both are below ALLOW.
    assert_eq!(core.store.current_trust(&id).await.unwrap(), 55);
    let after_first = core.orchestrator.current_decision(&id).unwrap();
    assert!(after_first.restriction_level() > Decision::Allow.restriction_level());

    // Second and third scans in later windows keep pushing trust down
    // (the anomaly window rate limit is per rule; re-firing needs a new
    // window, so drive the trust scorer through the detector twice more
    // by resetting its rate limiter via fresh detectors)
    for expected_trust in [40, 25] {
        let detector = AnomalyDetector::new(
            Arc::clone(&core.store),
            Arc::new(TrustScorer::new(
                Arc::clone(&core.store),
                Arc::clone(&core.bus),
                70,
                vec![70, 50, 30],
                5,
            )),
            Arc::clone(&core.bus),
            Duration::from_secs(60),
            0.1,
        );
        detector.handle_sample(&id, &flow(1.0, 15)).await;
        core.pump().await;
        assert_eq!(core.store.current_trust(&id).await.unwrap(), expected_trust);
    }

    // trust 25 < 30 ⇒ QUARANTINE
    assert_eq!(
        core.orchestrator.current_decision(&id),
        Some(Decision::Quarantine)
    );
}

#[tokio::test]
async fn s3_honeypot_hit_installs_permanent_deny() {
    let mut core = core();

    let log_dir = tempfile::tempdir().unwrap();
    let log_path = log_dir.path().join("events.json");
    std::fs::write(
        &log_path,
        format!(
            "{{\"timestamp\":\"{}\",\"eventid\":\"login_success\",\"src_ip\":\"198.51.100.7\"}}\n",
            Utc::now().to_rfc3339()
        ),
    )
    .unwrap();

    let ingestor = HoneypotIngestor::new(
        Arc::clone(&core.store),
        Arc::clone(&core.bus),
        &log_path,
        86_400,
    );
    assert_eq!(ingestor.poll_once().await, 1);
    core.pump().await;

    let rule = core
        .switch
        .rule(&RuleId::new("mit:198.51.100.7"))
        .expect("mitigation installed");
    assert_eq!(rule.action, ForwardAction::Drop);
    assert_eq!(rule.priority, 200);

    // Restart: a fresh orchestrator over the same store reinstalls it
    let switch2 = Arc::new(InMemorySwitch::new());
    let orchestrator2 = TrafficOrchestrator::new(
        Arc::clone(&core.store),
        Arc::clone(&core.bus),
        Arc::clone(&switch2) as Arc<dyn SwitchControl>,
        300,
        600,
        Some(7),
    );
    orchestrator2.restore_state().await.unwrap();
    assert!(switch2.rule(&RuleId::new("mit:198.51.100.7")).is_some());
}

#[tokio::test]
async fn s4_attestation_failure_cascade() {
    let mut core = core();
    let id = core.onboard_d1().await;
    core.store.set_last_seen(&id, Utc::now()).await.unwrap();

    core.ca.revoke(&id, "manually revoked").await.unwrap();

    // Three failing cycles: 70 → 50 → 30 → 10
    for _ in 0..3 {
        core.attestation.attest_all().await;
        core.pump().await;
    }
    assert_eq!(core.store.current_trust(&id).await.unwrap(), 10);

    // trust 10 < 30 ⇒ QUARANTINE: top-priority drop, allows removed
    assert_eq!(
        core.orchestrator.current_decision(&id),
        Some(Decision::Quarantine)
    );
    let mac: MacAddr = "aa:bb:cc:00:00:01".parse().unwrap();
    let rules = core.switch.rules_for_mac(&mac);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].priority, 65535);

    // Audit trail records the degradation
    let audit = core
        .store
        .audit_since(Utc::now() - chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(audit.last().unwrap().decision, Decision::Quarantine);
}

#[tokio::test]
async fn s6_threat_replay_is_idempotent() {
    let mut core = core();

    for _ in 0..1000 {
        core.bus.publish(Event::ThreatUpdated {
            source_ip: "198.51.100.7".parse().unwrap(),
            severity: trustplane_core::types::Severity::High,
        });
        core.pump().await;
    }

    assert_eq!(core.switch.install_count(), 1);
    assert_eq!(core.store.list_mitigations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn restart_roundtrip_recovers_identical_state() {
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("identity.db");

    let (id, policy_before, baseline_before, trust_before);
    {
        let store = Arc::new(IdentityStore::open(&db_path).unwrap());
        let bus = Arc::new(EventBus::new(256));
        let switch = Arc::new(InMemorySwitch::new());
        let ca_dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::init_or_load_root(ca_dir.path()).unwrap());
        let trust = Arc::new(TrustScorer::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            70,
            vec![70, 50, 30],
            5,
        ));
        let coordinator = OnboardingCoordinator::new(
            Arc::clone(&store),
            ca,
            Arc::clone(&trust),
            Arc::clone(&switch) as Arc<dyn SwitchControl>,
            Arc::clone(&bus),
            Duration::from_secs(300),
            5,
        );

        let mac: MacAddr = "aa:bb:cc:00:00:01".parse().unwrap();
        id = coordinator
            .register_discovered(mac, "camera", None)
            .await
            .unwrap();
        coordinator.approve_device(&id, "ok").await.unwrap();
        coordinator.finalize_device(&id).await.unwrap();
        trust.adjust(&id, -15, "incident").await.unwrap();

        policy_before = store.get_policy(&id).await.unwrap().unwrap();
        baseline_before = store.get_baseline(&id).await.unwrap().unwrap();
        trust_before = store.current_trust(&id).await.unwrap();
    }

    // Restart: fresh components over the same database
    let store = Arc::new(IdentityStore::open(&db_path).unwrap());
    let bus = Arc::new(EventBus::new(256));
    let switch = Arc::new(InMemorySwitch::new());
    let orchestrator = TrafficOrchestrator::new(
        Arc::clone(&store),
        bus,
        Arc::clone(&switch) as Arc<dyn SwitchControl>,
        300,
        600,
        Some(7),
    );
    orchestrator.restore_state().await.unwrap();

    assert_eq!(store.get_policy(&id).await.unwrap().unwrap(), policy_before);
    assert_eq!(
        store.get_baseline(&id).await.unwrap().unwrap(),
        baseline_before
    );
    assert_eq!(store.current_trust(&id).await.unwrap(), trust_before);
    assert_eq!(trust_before, 55);

    // Decision recomputed identically: trust 55 ⇒ REDIRECT
    assert_eq!(
        orchestrator.current_decision(&id),
        Some(Decision::Redirect)
    );
}
