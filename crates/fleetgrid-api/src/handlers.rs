//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` or the hook coordinator
//! and returns JSON responses in a uniform envelope.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;

use fleetgrid_hooks::{HookResult, SignalOutcome};
use fleetgrid_state::{GroupConfig, StateError};

use crate::ApiState;

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

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse + use<> {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error_response(e: &StateError) -> impl IntoResponse + use<> {
    let status = match e {
        StateError::CapacityExceeded(_) | StateError::InvalidConfig(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Lifecycle callbacks ────────────────────────────────────────────

/// Body of `POST /api/v1/lifecycle/complete`.
#[derive(serde::Deserialize)]
pub struct CompleteRequest {
    pub instance_id: String,
    pub result: HookResult,
}

/// Body of `POST /api/v1/lifecycle/heartbeat`.
#[derive(serde::Deserialize)]
pub struct HeartbeatRequest {
    pub instance_id: String,
}

/// Signal outcome returned for both callback routes.
#[derive(serde::Serialize)]
pub struct SignalResponse {
    pub outcome: SignalOutcome,
}

/// POST /api/v1/lifecycle/complete
pub async fn complete_lifecycle(
    State(state): State<ApiState>,
    Json(req): Json<CompleteRequest>,
) -> impl IntoResponse {
    match state.hooks.complete(&req.instance_id, req.result) {
        Ok(outcome) => {
            info!(instance_id = %req.instance_id, ?outcome, "lifecycle completion signal");
            // A resolved instance may free or fill capacity — nudge the loop.
            state.reconcile.notify_one();
            ApiResponse::ok(SignalResponse { outcome }).into_response()
        }
        Err(e) => {
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

/// POST /api/v1/lifecycle/heartbeat
pub async fn heartbeat_lifecycle(
    State(state): State<ApiState>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match state.hooks.heartbeat(&req.instance_id) {
        Ok(outcome) => ApiResponse::ok(SignalResponse { outcome }).into_response(),
        Err(e) => {
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

// ── Group configuration ────────────────────────────────────────────

/// GET /api/v1/group
pub async fn get_group(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.get_group() {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => state_error_response(&e).into_response(),
    }
}

/// PUT /api/v1/group
///
/// The envelope is validated; a desired capacity outside `[min, max]`
/// is rejected with 422, never clamped.
pub async fn put_group(
    State(state): State<ApiState>,
    Json(config): Json<GroupConfig>,
) -> impl IntoResponse {
    match state.store.put_group(&config) {
        Ok(()) => {
            info!(
                desired = config.desired_capacity,
                min = config.min_capacity,
                max = config.max_capacity,
                "group configuration updated"
            );
            state.reconcile.notify_one();
            ApiResponse::ok(config).into_response()
        }
        Err(e) => state_error_response(&e).into_response(),
    }
}

// ── Fleet inspection ───────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_instances() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => state_error_response(&e).into_response(),
    }
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_instance(&id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("instance not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error_response(&e).into_response(),
    }
}

/// GET /api/v1/warm-pool
pub async fn list_warm_pool(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_parked() {
        Ok(parked) => ApiResponse::ok(parked).into_response(),
        Err(e) => state_error_response(&e).into_response(),
    }
}

/// POST /api/v1/reconcile
pub async fn trigger_reconcile(State(state): State<ApiState>) -> impl IntoResponse {
    state.reconcile.notify_one();
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok("reconcile triggered"),
    )
}
