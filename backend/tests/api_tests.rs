//! Integration tests for the management API
//!
//! The router is built over in-memory components; requests are driven
//! through tower's oneshot without binding a socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use trustplane_bus::EventBus;
use trustplane_ca::CertificateAuthority;
use trustplane_controld::routes;
use trustplane_controld::state::AppState;
use trustplane_core::types::MacAddr;
use trustplane_identity::IdentityStore;
use trustplane_onboarding::OnboardingCoordinator;
use trustplane_orchestrator::TrafficOrchestrator;
use trustplane_switch::{InMemorySwitch, SwitchControl};
use trustplane_trust::TrustScorer;

struct Api {
    router: Router,
    store: Arc<IdentityStore>,
    _ca_dir: tempfile::TempDir,
}

fn api() -> Api {
    let store = Arc::new(IdentityStore::open_in_memory().unwrap());
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
    let coordinator = Arc::new(OnboardingCoordinator::new(
        Arc::clone(&store),
        ca,
        trust,
        Arc::clone(&switch) as Arc<dyn SwitchControl>,
        Arc::clone(&bus),
        Duration::from_secs(300),
        5,
    ));
    let orchestrator = Arc::new(TrafficOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&switch) as Arc<dyn SwitchControl>,
        300,
        600,
        Some(7),
    ));

    let state = AppState {
        store: Arc::clone(&store),
        coordinator,
        orchestrator,
    };
    Api {
        router: routes::router(state),
        store,
        _ca_dir: ca_dir,
    }
}

fn mac() -> MacAddr {
    "aa:bb:cc:00:00:01".parse().unwrap()
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let api = api();
    let (status, body) = send(&api.router, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_pending_listing_and_approval_flow() {
    let api = api();
    let id = api
        .store
        .register_pending(mac(), "camera", None)
        .await
        .unwrap();

    let (status, body) = send(&api.router, "GET", "/api/v1/devices/pending", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["mac"], "aa:bb:cc:00:00:01");

    let uri = format!("/api/v1/devices/{}/approve", id);
    let (status, body) = send(
        &api.router,
        "POST",
        &uri,
        Some(serde_json::json!({"note": "trusted vendor"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "profiling");
    assert!(body["cert_serial"].is_string());

    // Second approval conflicts (non-idempotent → 409)
    let (status, body) = send(
        &api.router,
        "POST",
        &uri,
        Some(serde_json::json!({"note": "again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "ERR_CONFLICT");
}

#[tokio::test]
async fn test_unknown_device_is_404_and_bad_id_is_400() {
    let api = api();
    let (status, body) = send(&api.router, "GET", "/api/v1/devices/dev-none-000", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "ERR_NOT_FOUND");

    let (status, body) = send(&api.router, "GET", "/api/v1/devices/x", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "ERR_VALIDATION");
}

#[tokio::test]
async fn test_finalize_then_policy_baseline_and_trust() {
    let api = api();
    let id = api
        .store
        .register_pending(mac(), "camera", None)
        .await
        .unwrap();
    send(
        &api.router,
        "POST",
        &format!("/api/v1/devices/{}/approve", id),
        Some(serde_json::json!({})),
    )
    .await;

    // Baseline is null before finalization
    let (status, _) = send(
        &api.router,
        "GET",
        &format!("/api/v1/devices/{}/baseline", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &api.router,
        "POST",
        &format!("/api/v1/devices/{}/finalize", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &api.router,
        "GET",
        &format!("/api/v1/devices/{}/policy", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rules = body["rules"].as_array().unwrap();
    let last = rules.last().unwrap();
    assert_eq!(last["action"], "deny");
    assert_eq!(last["priority"], 0);

    let (status, body) = send(
        &api.router,
        "GET",
        &format!("/api/v1/devices/{}/trust", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["score"], 70);

    let (status, body) = send(
        &api.router,
        "GET",
        &format!("/api/v1/devices/{}/baseline", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sparse"], true);
}

#[tokio::test]
async fn test_revoke_and_topology() {
    let api = api();
    let id = api
        .store
        .register_pending(mac(), "camera", None)
        .await
        .unwrap();
    send(
        &api.router,
        "POST",
        &format!("/api/v1/devices/{}/approve", id),
        Some(serde_json::json!({})),
    )
    .await;
    send(
        &api.router,
        "POST",
        &format!("/api/v1/devices/{}/finalize", id),
        None,
    )
    .await;

    let (status, _) = send(
        &api.router,
        "POST",
        &format!("/api/v1/devices/{}/revoke", id),
        Some(serde_json::json!({"note": "decommissioned"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Revoked devices remain visible in the topology
    let (status, body) = send(&api.router, "GET", "/api/v1/topology", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["status"], "revoked");

    // Releasing a revoked (not quarantined) device conflicts
    let (status, _) = send(
        &api.router,
        "POST",
        &format!("/api/v1/devices/{}/release", id),
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_audit_query_validation() {
    let api = api();
    let (status, _) = send(
        &api.router,
        "GET",
        "/api/v1/audit/decisions?since=yesterday",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&api.router, "GET", "/api/v1/audit/decisions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}
