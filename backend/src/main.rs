//! trustplane daemon
//!
//! Thin main over the policy-core library crates: loads configuration,
//! builds every component, spawns the periodic workers, and serves the
//! management API until ctrl-c. All real logic lives in the crates; the
//! daemon only wires them together.

use anyhow::Context;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use trustplane_analyst::{AnomalyDetector, AttestationLoop, FlowPoller};
use trustplane_bus::{EventBus, Scheduler};
use trustplane_ca::CertificateAuthority;
use trustplane_config::Config;
use trustplane_core::types::DeviceStatus;
use trustplane_deception::{HoneypotIngestor, MitigationGenerator};
use trustplane_identity::IdentityStore;
use trustplane_onboarding::OnboardingCoordinator;
use trustplane_orchestrator::TrafficOrchestrator;
use trustplane_controld::routes;
use trustplane_controld::state::AppState;
use trustplane_switch::{InMemorySwitch, QueuedSwitch, SwitchControl};
use trustplane_trust::TrustScorer;

/// Drain deadline for workers on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("configuration error (fatal)")?;
    init_tracing(&config);

    let (app_state, scheduler) = build_runtime(&config).await?;

    let app = routes::router(app_state);
    let listener = TcpListener::bind(&config.api.listen_address)
        .await
        .with_context(|| format!("cannot bind {}", config.api.listen_address))?;
    tracing::info!(address = %config.api.listen_address, "trustplane management API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down; draining workers");
    scheduler.shutdown(SHUTDOWN_DRAIN).await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn load_config() -> Result<Config, trustplane_config::ConfigError> {
    match std::env::var("TRUSTPLANE_CONFIG") {
        Ok(path) => Config::load_from_path(&PathBuf::from(path)),
        Err(_) => Config::load(),
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        "pretty" => tracing_subscriber::fmt().with_env_filter(filter).pretty().init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).compact().init(),
    }
}

/// Build every component and spawn the five workers plus the sweeps
async fn build_runtime(config: &Config) -> anyhow::Result<(AppState, Scheduler)> {
    let bus = Arc::new(EventBus::new(config.bus.event_queue_size));
    let store = Arc::new(IdentityStore::open(&config.identity.db_path)?);
    let ca = Arc::new(CertificateAuthority::init_or_load_root(
        &config.identity.ca_dir,
    )?);

    let trust = Arc::new(TrustScorer::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.trust.initial_score,
        config.trust.thresholds.clone(),
        config.trust.hysteresis,
    ));

    // The in-memory backend stands in until a real switch-control adapter
    // is plugged in; the queued wrapper provides the reconnect semantics
    // either way
    let switch = Arc::new(QueuedSwitch::new(
        InMemorySwitch::new(),
        config.switch.max_queue,
        Duration::from_secs(config.switch.max_disconnect_secs),
        Duration::from_secs(config.switch.call_timeout_secs),
    ));
    let switch_dyn: Arc<dyn SwitchControl> = Arc::clone(&switch) as Arc<dyn SwitchControl>;

    let coordinator = Arc::new(OnboardingCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&ca),
        Arc::clone(&trust),
        Arc::clone(&switch_dyn),
        Arc::clone(&bus),
        Duration::from_secs(config.profiling.duration_secs),
        config.profiling.min_packets,
    ));
    coordinator.resume_profiling().await?;

    let orchestrator = Arc::new(
        TrafficOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&switch_dyn),
            config.orchestrator.alert_window_secs,
            config.orchestrator.recovery_window_secs,
            config.switch.honeypot_port,
        )
        .with_install_retries(config.orchestrator.rule_install_retries),
    );
    orchestrator.restore_state().await?;

    if !config.redirect_capable() {
        tracing::warn!("honeypot_port not configured; redirect decisions will fail closed");
    }

    let poller = Arc::new(FlowPoller::new(
        Arc::clone(&store),
        Arc::clone(&switch_dyn),
        Arc::clone(&bus),
        config.analyst.flow_poll_interval_secs,
    ));
    let detector = Arc::new(AnomalyDetector::new(
        Arc::clone(&store),
        Arc::clone(&trust),
        Arc::clone(&bus),
        Duration::from_secs(config.analyst.anomaly_window_secs),
        config.profiling.ema_alpha,
    ));
    let attestation = Arc::new(AttestationLoop::new(
        Arc::clone(&store),
        Arc::clone(&ca),
        Arc::clone(&trust),
        Arc::clone(&bus),
        Duration::from_secs(config.analyst.attestation_interval_secs),
    ));
    let ingestor = Arc::new(HoneypotIngestor::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        &config.deception.honeypot_log_path,
        config.deception.threat_ttl_secs,
    ));
    let generator = Arc::new(MitigationGenerator::new(Arc::clone(&bus)));

    let mut scheduler = Scheduler::new();

    scheduler.spawn_worker("orchestrator", {
        let orchestrator = Arc::clone(&orchestrator);
        let receiver = bus.subscribe();
        async move { orchestrator.run(receiver).await }
    });
    scheduler.spawn_worker("anomaly-detector", {
        let detector = Arc::clone(&detector);
        let receiver = bus.subscribe();
        async move { detector.run(receiver).await }
    });
    scheduler.spawn_worker("attestation", {
        let attestation = Arc::clone(&attestation);
        let receiver = bus.subscribe();
        async move { attestation.run(receiver).await }
    });
    scheduler.spawn_worker("mitigation-generator", {
        let generator = Arc::clone(&generator);
        let receiver = bus.subscribe();
        async move { generator.run(receiver).await }
    });
    scheduler.spawn_worker("observations", {
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.observation_loop().await }
    });

    scheduler.spawn_periodic(
        "flow-poll",
        Duration::from_secs(config.analyst.flow_poll_interval_secs),
        {
            let poller = Arc::clone(&poller);
            move || {
                let poller = Arc::clone(&poller);
                async move { poller.poll_once().await }
            }
        },
    );
    scheduler.spawn_periodic(
        "honeypot-tail",
        Duration::from_secs(config.deception.tail_interval_secs.max(1)),
        {
            let ingestor = Arc::clone(&ingestor);
            move || {
                let ingestor = Arc::clone(&ingestor);
                async move {
                    ingestor.poll_once().await;
                }
            }
        },
    );
    scheduler.spawn_periodic("threat-ttl-sweep", Duration::from_secs(600), {
        let ingestor = Arc::clone(&ingestor);
        move || {
            let ingestor = Arc::clone(&ingestor);
            async move { ingestor.sweep_expired().await }
        }
    });
    scheduler.spawn_periodic(
        "finalize-sweep",
        Duration::from_secs(config.profiling.finalize_check_interval_secs),
        {
            let coordinator = Arc::clone(&coordinator);
            move || {
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.sweep_finalize().await }
            }
        },
    );
    scheduler.spawn_periodic("switch-flush", Duration::from_secs(1), {
        let switch = Arc::clone(&switch);
        let orchestrator = Arc::clone(&orchestrator);
        move || {
            let switch = Arc::clone(&switch);
            let orchestrator = Arc::clone(&orchestrator);
            async move {
                let was_available = switch.is_available();
                switch.flush().await;
                if !was_available && switch.is_available() {
                    tracing::info!("switch adapter recovered; resyncing all decisions");
                    if let Err(e) = orchestrator.resync_devices().await {
                        tracing::error!(error = %e, "post-recovery resync failed");
                    }
                }
            }
        }
    });

    // Optional positive drift: +2 per uneventful hour, off by default
    if config.trust.positive_tick {
        scheduler.spawn_periodic("positive-tick", Duration::from_secs(3600), {
            let store = Arc::clone(&store);
            let trust = Arc::clone(&trust);
            move || {
                let store = Arc::clone(&store);
                let trust = Arc::clone(&trust);
                async move {
                    let devices = match store.list_by_status(DeviceStatus::Active).await {
                        Ok(devices) => devices,
                        Err(_) => return,
                    };
                    for device in devices {
                        let last_event = store
                            .trust_history(&device.id, 1)
                            .await
                            .ok()
                            .and_then(|h| h.into_iter().next());
                        let uneventful = last_event
                            .map(|e| Utc::now() - e.timestamp >= chrono::Duration::hours(1))
                            .unwrap_or(true);
                        if uneventful {
                            let _ = trust.record_positive_tick(&device.id).await;
                        }
                    }
                }
            }
        });
    }

    let app_state = AppState {
        store,
        coordinator,
        orchestrator,
    };
    Ok((app_state, scheduler))
}
