//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` and the shared rollout
//! controller, and returns JSON responses. Operator commands only mutate
//! state; the daemon's loops pick the changes up on their next tick.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::info;

use rudder_rollout::{RolloutError, RolloutPhase};
use rudder_state::StateError;

use crate::{ApiState, ManualOverride};

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn store_error(e: StateError) -> axum::response::Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let desired = match state.store.get_desired() {
        Ok(d) => d,
        Err(e) => return store_error(e),
    };
    let instances = match state.store.list_instances() {
        Ok(list) => list,
        Err(e) => return store_error(e),
    };
    let flags = match state.store.get_status() {
        Ok(f) => f,
        Err(e) => return store_error(e),
    };

    let ready = instances.iter().filter(|r| r.is_ready()).count() as u32;
    let active = instances.iter().filter(|r| r.is_active()).count() as u32;
    let rollout = state.rollout.read().await;

    ApiResponse::ok(serde_json::json!({
        "desired_replicas": desired.desired_replicas,
        "replicas_min": desired.replicas_min,
        "replicas_max": desired.replicas_max,
        "template": desired.template,
        "ready": ready,
        "active": active,
        "total": instances.len(),
        "rollout": rollout.phase(),
        "degraded": flags.degraded,
        "degraded_reason": flags.reason,
    }))
    .into_response()
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_instances() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Scaling ────────────────────────────────────────────────────

/// Scale request body.
#[derive(serde::Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

/// POST /api/v1/scale
///
/// Manual override of the desired replica count. Rejected while a
/// rollout is active (the rollout controller owns the count), and
/// rejected outside `[replicas_min, replicas_max]`.
pub async fn scale(
    State(state): State<ApiState>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    {
        let rollout = state.rollout.read().await;
        if rollout.is_active() {
            return error_response(
                "a rollout is in progress; the desired count is not manually scalable",
                StatusCode::CONFLICT,
            )
            .into_response();
        }
    }

    let mut desired = match state.store.get_desired() {
        Ok(d) => d,
        Err(e) => return store_error(e),
    };

    if req.replicas < desired.replicas_min || req.replicas > desired.replicas_max {
        return error_response(
            &format!(
                "replicas {} outside [{}, {}]",
                req.replicas, desired.replicas_min, desired.replicas_max
            ),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }

    let now = epoch_secs();
    desired.desired_replicas = req.replicas;
    desired.updated_at = now;
    if let Err(e) = state.store.put_desired(&desired) {
        return store_error(e);
    }
    *state.manual.write().await = Some(ManualOverride {
        replicas: req.replicas,
        set_at: now,
    });

    info!(replicas = req.replicas, "manual scale accepted");
    ApiResponse::ok(serde_json::json!({
        "replicas": req.replicas,
        "status": "accepted"
    }))
    .into_response()
}

// ── Rollouts ───────────────────────────────────────────────────

/// Rollout request body.
#[derive(serde::Deserialize)]
pub struct RolloutRequest {
    pub new_template: String,
}

/// POST /api/v1/rollouts
pub async fn start_rollout(
    State(state): State<ApiState>,
    Json(req): Json<RolloutRequest>,
) -> impl IntoResponse {
    if req.new_template.trim().is_empty() {
        return error_response("new_template must not be empty", StatusCode::BAD_REQUEST)
            .into_response();
    }

    let mut desired = match state.store.get_desired() {
        Ok(d) => d,
        Err(e) => return store_error(e),
    };
    if desired.template == req.new_template {
        return error_response(
            &format!("template {} is already active", req.new_template),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }

    let now = epoch_secs();
    let mut rollout = state.rollout.write().await;
    let plan = match rollout.start(&desired.template, &req.new_template, &desired.rollout, now) {
        Ok(plan) => plan.clone(),
        Err(e @ RolloutError::AlreadyActive) => {
            return error_response(&e.to_string(), StatusCode::CONFLICT).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };

    // Persist the plan (restart recovery), then flip the active template
    // so replacements come from the new one.
    if let Err(e) = state.store.put_rollout_plan(&plan) {
        return store_error(e);
    }
    desired.template = req.new_template.clone();
    desired.updated_at = now;
    if let Err(e) = state.store.put_desired(&desired) {
        return store_error(e);
    }

    (StatusCode::CREATED, ApiResponse::ok(plan)).into_response()
}

/// GET /api/v1/rollouts/current
pub async fn current_rollout(State(state): State<ApiState>) -> impl IntoResponse {
    let rollout = state.rollout.read().await;
    if rollout.phase() == &RolloutPhase::Idle {
        return error_response("no rollout in progress", StatusCode::NOT_FOUND).into_response();
    }
    ApiResponse::ok(serde_json::json!({
        "phase": rollout.phase(),
        "plan": rollout.plan(),
    }))
    .into_response()
}

/// POST /api/v1/rollouts/pause
pub async fn pause_rollout(State(state): State<ApiState>) -> impl IntoResponse {
    let mut rollout = state.rollout.write().await;
    match rollout.pause() {
        Ok(()) => ApiResponse::ok(serde_json::json!({"phase": rollout.phase()})).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::CONFLICT).into_response(),
    }
}

/// POST /api/v1/rollouts/resume
pub async fn resume_rollout(State(state): State<ApiState>) -> impl IntoResponse {
    let mut rollout = state.rollout.write().await;
    match rollout.resume() {
        Ok(()) => ApiResponse::ok(serde_json::json!({"phase": rollout.phase()})).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::CONFLICT).into_response(),
    }
}

/// POST /api/v1/rollouts/abort
///
/// Accepts the abort; the daemon's rollout loop performs the drain on
/// its next tick.
pub async fn abort_rollout(State(state): State<ApiState>) -> impl IntoResponse {
    let mut rollout = state.rollout.write().await;
    match rollout.abort() {
        Ok(()) => ApiResponse::ok(serde_json::json!({"phase": rollout.phase()})).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::CONFLICT).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use rudder_rollout::RolloutController;
    use rudder_state::{
        DesiredState, ProbeSettings, RolloutSettings, StateStore,
    };

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        ApiState::new(store, Arc::new(RwLock::new(RolloutController::new())))
    }

    fn desired(min: u32, max: u32, current: u32) -> DesiredState {
        DesiredState {
            replicas_min: min,
            replicas_max: max,
            target_cpu_percent: 70.0,
            desired_replicas: current,
            template: "v1".to_string(),
            rollout: RolloutSettings::default(),
            probe: ProbeSettings::default(),
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn status_without_desired_state_is_not_found() {
        let state = test_state();
        let resp = get_status(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let state = test_state();
        state.store.put_desired(&desired(1, 5, 2)).unwrap();
        let resp = get_status(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_instances_empty() {
        let state = test_state();
        let resp = list_instances(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scale_within_bounds_updates_desired_and_records_override() {
        let state = test_state();
        state.store.put_desired(&desired(1, 5, 2)).unwrap();

        let resp = scale(State(state.clone()), Json(ScaleRequest { replicas: 4 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(state.store.get_desired().unwrap().desired_replicas, 4);
        let manual = state.manual.read().await;
        assert_eq!(manual.map(|m| m.replicas), Some(4));
    }

    #[tokio::test]
    async fn scale_outside_bounds_is_rejected() {
        let state = test_state();
        state.store.put_desired(&desired(2, 5, 2)).unwrap();

        let resp = scale(State(state.clone()), Json(ScaleRequest { replicas: 6 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = scale(State(state.clone()), Json(ScaleRequest { replicas: 1 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Desired state untouched.
        assert_eq!(state.store.get_desired().unwrap().desired_replicas, 2);
    }

    #[tokio::test]
    async fn scale_during_rollout_is_rejected() {
        let state = test_state();
        state.store.put_desired(&desired(1, 5, 2)).unwrap();
        state
            .rollout
            .write()
            .await
            .start("v1", "v2", &RolloutSettings::default(), 1000)
            .unwrap();

        let resp = scale(State(state), Json(ScaleRequest { replicas: 3 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn start_rollout_persists_plan_and_flips_template() {
        let state = test_state();
        state.store.put_desired(&desired(1, 5, 2)).unwrap();

        let resp = start_rollout(
            State(state.clone()),
            Json(RolloutRequest { new_template: "v2".to_string() }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let plan = state.store.get_rollout_plan().unwrap().unwrap();
        assert_eq!(plan.old_template, "v1");
        assert_eq!(plan.new_template, "v2");
        assert_eq!(state.store.get_desired().unwrap().template, "v2");
        assert!(state.rollout.read().await.is_active());
    }

    #[tokio::test]
    async fn start_rollout_to_active_template_is_rejected() {
        let state = test_state();
        state.store.put_desired(&desired(1, 5, 2)).unwrap();

        let resp = start_rollout(
            State(state),
            Json(RolloutRequest { new_template: "v1".to_string() }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn second_rollout_is_conflict() {
        let state = test_state();
        state.store.put_desired(&desired(1, 5, 2)).unwrap();

        start_rollout(
            State(state.clone()),
            Json(RolloutRequest { new_template: "v2".to_string() }),
        )
        .await;

        let resp = start_rollout(
            State(state),
            Json(RolloutRequest { new_template: "v3".to_string() }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn current_rollout_is_not_found_when_idle() {
        let state = test_state();
        let resp = current_rollout(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pause_resume_abort_lifecycle() {
        let state = test_state();
        state.store.put_desired(&desired(1, 5, 2)).unwrap();
        start_rollout(
            State(state.clone()),
            Json(RolloutRequest { new_template: "v2".to_string() }),
        )
        .await;

        let resp = pause_rollout(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = current_rollout(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = resume_rollout(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = abort_rollout(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.rollout.read().await.phase(),
            &RolloutPhase::Aborting
        );
    }

    #[tokio::test]
    async fn rollout_commands_without_rollout_are_conflict() {
        let state = test_state();
        let resp = pause_rollout(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = resume_rollout(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = abort_rollout(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
