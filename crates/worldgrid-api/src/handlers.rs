//! REST API handlers.
//!
//! Record reads go straight to the `StateStore`; everything that touches the
//! provider goes through the lifecycle components and returns the issued
//! operation rather than waiting for it.

use axum::Json;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use worldgrid_core::OperationHandle;
use worldgrid_lifecycle::{IssuedOperation, LifecycleError, UnitOutcome};
use worldgrid_tasks::{TaskError, TaskParams};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn failed(data: T, msg: String) -> Json<Self> {
        Json(Self {
            success: false,
            data: Some(data),
            error: Some(msg),
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn lifecycle_error(e: LifecycleError) -> Response {
    let status = match &e {
        LifecycleError::Decode(_) => StatusCode::BAD_REQUEST,
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::Conflict(_) => StatusCode::CONFLICT,
        LifecycleError::Provider(_) | LifecycleError::State(_) | LifecycleError::Task(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        warn!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Worlds ─────────────────────────────────────────────────────

/// GET /api/v1/worlds
pub async fn list_worlds(State(state): State<ApiState>) -> Response {
    match state.store.list_worlds() {
        Ok(worlds) => ApiResponse::ok(worlds).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/worlds/{world}
pub async fn get_world(State(state): State<ApiState>, Path(world): Path<String>) -> Response {
    match state.store.get_world(&world) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("world not found", StatusCode::NOT_FOUND),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ── Instance operations ────────────────────────────────────────

/// Create request body. Both fields are optional.
#[derive(Debug, Default, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub zone: Option<String>,
    /// Static external address to attach.
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Reset,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: InstanceAction,
}

#[derive(Serialize)]
struct IssuedView {
    world: String,
    instance: String,
    operation: OperationHandle,
    generation: u64,
}

fn accepted(world: String, issued: IssuedOperation) -> Response {
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(IssuedView {
            world,
            instance: issued.instance_name,
            operation: issued.handle,
            generation: issued.generation,
        }),
    )
        .into_response()
}

/// POST /api/v1/worlds/{world}/instance
pub async fn create_instance(
    State(state): State<ApiState>,
    Path(world): Path<String>,
    Json(req): Json<CreateRequest>,
) -> Response {
    let result = state
        .lifecycle
        .controller
        .create(&world, req.zone.as_deref(), req.ip.as_deref())
        .await;
    match result {
        Ok(issued) => accepted(world, issued),
        Err(e) => lifecycle_error(e),
    }
}

/// PUT /api/v1/worlds/{world}/instance
pub async fn update_instance(
    State(state): State<ApiState>,
    Path(world): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Response {
    let controller = &state.lifecycle.controller;
    let result = match req.action {
        InstanceAction::Start => controller.start(&world).await,
        InstanceAction::Reset => controller.reset(&world).await,
    };
    match result {
        Ok(issued) => accepted(world, issued),
        Err(e) => lifecycle_error(e),
    }
}

/// DELETE /api/v1/worlds/{world}/instance
pub async fn delete_instance(State(state): State<ApiState>, Path(world): Path<String>) -> Response {
    match state.lifecycle.controller.delete(&world).await {
        Ok(issued) => accepted(world, issued),
        Err(e) => lifecycle_error(e),
    }
}

// ── Cron triggers ──────────────────────────────────────────────

#[derive(Serialize)]
struct SweepView {
    scanned: usize,
    snapshots_issued: usize,
    deletes_issued: usize,
    skipped: Vec<String>,
    failures: Vec<String>,
}

/// POST /cron/sweep
///
/// 500 when the listing fails or any unit fails; the body still carries
/// the per-unit summary in the latter case.
pub async fn cron_sweep(State(state): State<ApiState>) -> Response {
    let report = match state.lifecycle.sweep.run_once().await {
        Ok(report) => report,
        Err(e) => return lifecycle_error(e),
    };

    let mut view = SweepView {
        scanned: report.scanned,
        snapshots_issued: report.snapshots_issued(),
        deletes_issued: report.deletes_issued(),
        skipped: Vec::new(),
        failures: Vec::new(),
    };
    for unit in &report.units {
        match &unit.outcome {
            UnitOutcome::Skipped(reason) => view.skipped.push(format!("{}: {reason}", unit.instance)),
            UnitOutcome::Failed(reason) => view.failures.push(format!("{}: {reason}", unit.instance)),
            UnitOutcome::Issued(_) => {}
        }
    }

    if report.is_success() {
        ApiResponse::ok(view).into_response()
    } else {
        let msg = format!("{} sweep unit(s) failed", view.failures.len());
        (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::failed(view, msg)).into_response()
    }
}

#[derive(Serialize)]
struct RenderView {
    started: Vec<String>,
    failures: Vec<String>,
}

/// POST /cron/render
pub async fn cron_render(State(state): State<ApiState>) -> Response {
    let report = match state.lifecycle.render.run_once().await {
        Ok(report) => report,
        Err(e) => return lifecycle_error(e),
    };
    let view = RenderView {
        started: report
            .started
            .iter()
            .map(|(world, snapshot)| format!("{world}: {snapshot}"))
            .collect(),
        failures: report
            .failures
            .iter()
            .map(|(world, err)| format!("{world}: {err}"))
            .collect(),
    };
    if report.is_success() {
        ApiResponse::ok(view).into_response()
    } else {
        let msg = format!("{} render clone(s) failed", view.failures.len());
        (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::failed(view, msg)).into_response()
    }
}

// ── Tasks ──────────────────────────────────────────────────────

/// POST /tasks/{name}
///
/// Runs the handler inline. The status code is the handler outcome's, so
/// an external queue can apply its own retry policy.
pub async fn deliver_task(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Form(params): Form<TaskParams>,
) -> Response {
    match state.dispatcher.handle_now(&name, &params).await {
        Ok(outcome) => {
            info!(task = %name, %outcome, "task delivered over http");
            let status = outcome.status_code();
            let body = serde_json::json!({ "task": name, "outcome": outcome.to_string() });
            if status.is_success() {
                ApiResponse::ok(body).into_response()
            } else {
                (status, ApiResponse::failed(body, outcome.to_string())).into_response()
            }
        }
        Err(TaskError::UnknownRoute(route)) => {
            error_response(&format!("no handler for task {route}"), StatusCode::NOT_FOUND)
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<ApiState>) -> Response {
    match state.store.list_tasks() {
        Ok(tasks) => ApiResponse::ok(tasks).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/dead-letters
pub async fn list_dead_letters(State(state): State<ApiState>) -> Response {
    match state.store.list_dead_letters() {
        Ok(letters) => ApiResponse::ok(letters).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}
