use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bulk::{BulkOperations, BulkSubmission};
use crate::convergence::{ConvergenceStatus, SessionRegistry};
use crate::gate::AdmissionGate;
use crate::ledger::{MajorOperation, OperationHandle, OperationStatus};

#[derive(Clone)]
pub struct ApiState {
    pub gate: AdmissionGate,
    pub bulk: Arc<BulkOperations>,
    pub sessions: Arc<SessionRegistry>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Ledger
        .route("/operations", get(list_operations))
        .route("/operations/:id", get(get_operation))
        .route("/operations/:id/progress", post(update_progress))
        .route("/operations/:id/complete", post(complete_operation))
        // Gated bulk work
        .route("/bulk/score", post(bulk_score))
        .route("/bulk/enrich", post(bulk_enrich))
        // Per-deal convergence
        .route("/deals/:id/ensure-scored", post(ensure_scored))
        .route(
            "/deals/:id/convergence",
            get(get_convergence).delete(reset_convergence),
        )
        .route("/deals/:id/check-now", post(check_now))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

fn internal_err(e: anyhow::Error) -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

#[derive(Debug, Deserialize)]
pub struct ListOperationsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct OperationView {
    #[serde(flatten)]
    pub operation: MajorOperation,
    pub percent: u8,
}

impl From<MajorOperation> for OperationView {
    fn from(operation: MajorOperation) -> Self {
        let percent = operation.percent();
        Self { operation, percent }
    }
}

#[derive(Debug, Serialize)]
pub struct ListOperationsResponse {
    pub items: Vec<OperationView>,
}

pub async fn list_operations(
    State(state): State<ApiState>,
    Query(q): Query<ListOperationsQuery>,
) -> Result<Json<ListOperationsResponse>, (StatusCode, String)> {
    let status = match q.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            OperationStatus::parse(s).ok_or_else(|| bad_request(format!("unknown status {s:?}")))?,
        ),
    };

    let items = state
        .gate
        .ledger()
        .list(status, q.limit.unwrap_or(50))
        .await
        .map_err(internal_err)?;

    Ok(Json(ListOperationsResponse {
        items: items.into_iter().map(OperationView::from).collect(),
    }))
}

pub async fn get_operation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OperationView>, (StatusCode, String)> {
    match state.gate.ledger().get(id).await.map_err(internal_err)? {
        Some(op) => Ok(Json(op.into())),
        None => Err((StatusCode::NOT_FOUND, format!("operation {id} not found"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub completed_items: i32,
}

#[derive(Debug, Serialize)]
pub struct ChangedResponse {
    pub changed: bool,
}

pub async fn update_progress(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ProgressRequest>,
) -> Result<Json<ChangedResponse>, (StatusCode, String)> {
    let changed = state
        .gate
        .update_progress(&OperationHandle { id }, body.completed_items)
        .await
        .map_err(internal_err)?;
    Ok(Json(ChangedResponse { changed }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub status: OperationStatus,
}

pub async fn complete_operation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<ChangedResponse>, (StatusCode, String)> {
    if !body.status.is_terminal() {
        return Err(bad_request("status must be completed or failed"));
    }
    let changed = state
        .gate
        .complete_operation(&OperationHandle { id }, body.status)
        .await
        .map_err(internal_err)?;
    Ok(Json(ChangedResponse { changed }))
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub deal_ids: Vec<Uuid>,
    #[serde(default)]
    pub owner: Option<String>,
}

pub async fn bulk_score(
    State(state): State<ApiState>,
    Json(body): Json<BulkRequest>,
) -> Result<Json<BulkSubmission>, (StatusCode, String)> {
    if body.deal_ids.is_empty() {
        return Err(bad_request("deal_ids is required"));
    }
    let owner = body.owner.unwrap_or_else(|| "admin".to_string());
    let submission = state
        .bulk
        .submit_scoring(body.deal_ids, &owner)
        .await
        .map_err(internal_err)?;
    Ok(Json(submission))
}

pub async fn bulk_enrich(
    State(state): State<ApiState>,
    Json(body): Json<BulkRequest>,
) -> Result<Json<BulkSubmission>, (StatusCode, String)> {
    if body.deal_ids.is_empty() {
        return Err(bad_request("deal_ids is required"));
    }
    let owner = body.owner.unwrap_or_else(|| "admin".to_string());
    let submission = state
        .bulk
        .submit_enrichment(body.deal_ids, &owner)
        .await
        .map_err(internal_err)?;
    Ok(Json(submission))
}

#[derive(Debug, Serialize)]
pub struct EnsureScoredResponse {
    /// False when a run is already in flight for this deal.
    pub triggered: bool,
    pub status: ConvergenceStatus,
}

pub async fn ensure_scored(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Json<EnsureScoredResponse> {
    let (triggered, status) = state.sessions.ensure_converged(id);
    Json(EnsureScoredResponse { triggered, status })
}

pub async fn get_convergence(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Json<ConvergenceStatus> {
    let status = state
        .sessions
        .get(id)
        .map(|s| s.status())
        .unwrap_or_else(|| ConvergenceStatus::idle(Some(id)));
    Json(status)
}

pub async fn check_now(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConvergenceStatus>, (StatusCode, String)> {
    let status = state.sessions.check_now(id).await.map_err(internal_err)?;
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub removed: bool,
}

/// Cancel and forget the deal's session; the next ensure-scored starts over.
pub async fn reset_convergence(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Json<RemovedResponse> {
    Json(RemovedResponse {
        removed: state.sessions.remove(id),
    })
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
