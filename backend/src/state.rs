//! Shared application state for the management API

use std::sync::Arc;
use trustplane_identity::IdentityStore;
use trustplane_onboarding::OnboardingCoordinator;
use trustplane_orchestrator::TrafficOrchestrator;

/// Handles every route needs; everything is Arc-shared with the runtime
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<IdentityStore>,
    pub coordinator: Arc<OnboardingCoordinator>,
    pub orchestrator: Arc<TrafficOrchestrator>,
}
