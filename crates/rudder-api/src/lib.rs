//! rudder-api — REST API for the rudder daemon.
//!
//! Provides axum route handlers for inspecting the instance set and for
//! the operator commands: manual scaling and rollout control.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Desired state, counts, rollout phase, health |
//! | GET | `/api/v1/instances` | List instance records |
//! | POST | `/api/v1/scale` | Manually override the desired replica count |
//! | POST | `/api/v1/rollouts` | Start a rollout to a new template |
//! | GET | `/api/v1/rollouts/current` | The in-flight rollout, if any |
//! | POST | `/api/v1/rollouts/pause` | Pause the in-flight rollout |
//! | POST | `/api/v1/rollouts/resume` | Resume a paused rollout |
//! | POST | `/api/v1/rollouts/abort` | Gracefully abort the rollout |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::RwLock;

use rudder_rollout::RolloutController;
use rudder_state::StateStore;

/// A manual replica-count override, recorded so the autoscaler defers to
/// it for a grace period instead of immediately reverting it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualOverride {
    pub replicas: u32,
    /// Unix timestamp (seconds) the override was accepted.
    pub set_at: u64,
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub rollout: Arc<RwLock<RolloutController>>,
    pub manual: Arc<RwLock<Option<ManualOverride>>>,
}

impl ApiState {
    pub fn new(store: StateStore, rollout: Arc<RwLock<RolloutController>>) -> Self {
        Self {
            store,
            rollout,
            manual: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::get_status))
        .route("/instances", get(handlers::list_instances))
        .route("/scale", post(handlers::scale))
        .route("/rollouts", post(handlers::start_rollout))
        .route("/rollouts/current", get(handlers::current_rollout))
        .route("/rollouts/pause", post(handlers::pause_rollout))
        .route("/rollouts/resume", post(handlers::resume_rollout))
        .route("/rollouts/abort", post(handlers::abort_rollout))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
