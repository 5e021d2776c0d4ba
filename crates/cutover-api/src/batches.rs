// Batch operations and audit-trail routes

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use cutover_contracts::{
    Batch, BatchMember, InitExecution, ListResponse, OperationOutcome, PhaseExecution,
    StepExecution,
};
use cutover_engine::{AdvanceOutcome, ManualBatchService};
use cutover_storage::models::{
    BatchMemberRow, BatchRow, InitExecutionRow, PhaseExecutionRow, StepExecutionRow,
};
use cutover_storage::Database;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::{require_admin, require_auth, AuthState};
use crate::common::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub manual: ManualBatchService,
}

/// Request to create a manual batch. Members come from explicit rows, a CSV
/// payload, or both.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateBatchRequest {
    pub runbook_name: String,
    pub batch_start_time: DateTime<Utc>,
    /// Member rows: column → value
    #[serde(default)]
    pub members: Vec<BTreeMap<String, String>>,
    /// CSV document with a header row
    #[serde(default)]
    pub csv: Option<String>,
}

/// Request to add members to a manual batch
#[derive(Debug, Deserialize, ToSchema)]
pub struct AddMembersRequest {
    #[serde(default)]
    pub members: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub csv: Option<String>,
}

/// Request to remove members from a manual batch
#[derive(Debug, Deserialize, ToSchema)]
pub struct RemoveMembersRequest {
    pub member_keys: Vec<String>,
}

/// Query filter for batch listing
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListBatchesParams {
    pub runbook: Option<String>,
}

/// Create batch routes with their authorization requirements
pub fn routes(state: AppState, auth: AuthState) -> Router {
    Router::new()
        .route(
            "/v1/batches",
            post(create_batch)
                .route_layer(from_fn_with_state(auth.clone(), require_admin))
                .get(list_batches),
        )
        .route(
            "/v1/batches/:batch_id/advance",
            post(advance_batch).route_layer(from_fn_with_state(auth.clone(), require_admin)),
        )
        .route(
            "/v1/batches/:batch_id/cancel",
            post(cancel_batch).route_layer(from_fn_with_state(auth.clone(), require_admin)),
        )
        .route(
            "/v1/batches/:batch_id/members",
            post(add_members)
                .delete(remove_members)
                .route_layer(from_fn_with_state(auth.clone(), require_admin))
                .get(list_members),
        )
        .route("/v1/batches/:batch_id", get(get_batch))
        .route("/v1/batches/:batch_id/phases", get(list_phases))
        .route(
            "/v1/batches/:batch_id/phases/:phase_execution_id/steps",
            get(list_phase_steps),
        )
        .route("/v1/batches/:batch_id/inits", get(list_inits))
        .route_layer(from_fn_with_state(auth, require_auth))
        .with_state(state)
}

/// POST /v1/batches - Create a manual batch
#[utoipa::path(
    post,
    path = "/v1/batches",
    request_body = CreateBatchRequest,
    responses(
        (status = 201, description = "Manual batch created", body = Batch),
        (status = 400, description = "Invalid CSV or member rows"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn create_batch(
    State(state): State<AppState>,
    Json(req): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<Batch>), ApiError> {
    let (rows, warnings) = collect_member_rows(
        &state,
        &req.runbook_name,
        req.members,
        req.csv.as_deref(),
    )
    .await?;

    let created = state
        .manual
        .create_batch(&req.runbook_name, req.batch_start_time, rows, warnings)
        .await?;

    Ok((StatusCode::CREATED, Json(to_batch(created.batch))))
}

/// GET /v1/batches - List batches, optionally per runbook
#[utoipa::path(
    get,
    path = "/v1/batches",
    params(("runbook" = Option<String>, Query, description = "Filter by runbook name")),
    responses(
        (status = 200, description = "Batches", body = ListResponse<Batch>),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn list_batches(
    State(state): State<AppState>,
    Query(params): Query<ListBatchesParams>,
) -> Result<Json<ListResponse<Batch>>, ApiError> {
    let rows = state.db.list_batches(params.runbook.as_deref()).await?;
    Ok(Json(
        rows.into_iter().map(to_batch).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/batches/:batch_id
#[utoipa::path(
    get,
    path = "/v1/batches/{batch_id}",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Batch found", body = Batch),
        (status = 404, description = "Batch not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<Batch>, ApiError> {
    let row = state
        .db
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("batch {batch_id}")))?;
    Ok(Json(to_batch(row)))
}

/// POST /v1/batches/:batch_id/advance - Advance a manual batch's state
/// machine one step
#[utoipa::path(
    post,
    path = "/v1/batches/{batch_id}/advance",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Advance outcome", body = OperationOutcome),
        (status = 400, description = "Precondition violated (init or phase in progress, non-manual batch)"),
        (status = 404, description = "Batch not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn advance_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<OperationOutcome>, ApiError> {
    let outcome = state.manual.advance(batch_id).await?;
    let outcome = match outcome {
        AdvanceOutcome::InitDispatched => OperationOutcome::new("init_dispatched"),
        AdvanceOutcome::Activated => OperationOutcome::new("activated"),
        AdvanceOutcome::PhaseDispatched(phase) => {
            OperationOutcome::new("phase_dispatched").with_detail(phase)
        }
        AdvanceOutcome::Completed => OperationOutcome::new("completed"),
        AdvanceOutcome::AlreadyCompleted => {
            OperationOutcome::new("no_op").with_detail("batch already completed")
        }
    };
    Ok(Json(outcome))
}

/// POST /v1/batches/:batch_id/cancel
#[utoipa::path(
    post,
    path = "/v1/batches/{batch_id}/cancel",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Batch cancelled", body = OperationOutcome),
        (status = 400, description = "Batch is terminal or not manual"),
        (status = 404, description = "Batch not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<OperationOutcome>, ApiError> {
    state.manual.cancel(batch_id).await?;
    Ok(Json(OperationOutcome::new("cancelled")))
}

/// GET /v1/batches/:batch_id/members
#[utoipa::path(
    get,
    path = "/v1/batches/{batch_id}/members",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Batch members", body = ListResponse<BatchMember>),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn list_members(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<ListResponse<BatchMember>>, ApiError> {
    let rows = state.db.list_members(batch_id).await?;
    Ok(Json(
        rows.into_iter().map(to_member).collect::<Vec<_>>().into(),
    ))
}

/// POST /v1/batches/:batch_id/members - Add members to a manual batch
#[utoipa::path(
    post,
    path = "/v1/batches/{batch_id}/members",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    request_body = AddMembersRequest,
    responses(
        (status = 200, description = "Members added", body = OperationOutcome),
        (status = 400, description = "Invalid rows or non-manual batch"),
        (status = 404, description = "Batch not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn add_members(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<OperationOutcome>, ApiError> {
    let batch = state
        .db
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("batch {batch_id}")))?;
    let (rows, warnings) =
        collect_member_rows(&state, &batch.runbook_name, req.members, req.csv.as_deref()).await?;

    let added = state.manual.add_members(batch_id, rows).await?;
    Ok(Json(
        OperationOutcome::new("members_added")
            .with_detail(format!("{added} members"))
            .with_warnings(warnings),
    ))
}

/// DELETE /v1/batches/:batch_id/members - Remove members from a manual batch
#[utoipa::path(
    delete,
    path = "/v1/batches/{batch_id}/members",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    request_body = RemoveMembersRequest,
    responses(
        (status = 200, description = "Members removed", body = OperationOutcome),
        (status = 400, description = "Non-manual batch"),
        (status = 404, description = "Batch not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn remove_members(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
    Json(req): Json<RemoveMembersRequest>,
) -> Result<Json<OperationOutcome>, ApiError> {
    let removed = state
        .manual
        .remove_members(batch_id, &req.member_keys)
        .await?;
    Ok(Json(
        OperationOutcome::new("members_removed").with_detail(format!("{removed} members")),
    ))
}

/// GET /v1/batches/:batch_id/phases - The batch's phase audit trail
#[utoipa::path(
    get,
    path = "/v1/batches/{batch_id}/phases",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Phase executions", body = ListResponse<PhaseExecution>),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn list_phases(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<ListResponse<PhaseExecution>>, ApiError> {
    let rows = state.db.list_phases(batch_id).await?;
    Ok(Json(
        rows.into_iter().map(to_phase).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/batches/:batch_id/phases/:phase_execution_id/steps
#[utoipa::path(
    get,
    path = "/v1/batches/{batch_id}/phases/{phase_execution_id}/steps",
    params(
        ("batch_id" = i64, Path, description = "Batch ID"),
        ("phase_execution_id" = i64, Path, description = "Phase execution ID")
    ),
    responses(
        (status = 200, description = "Step executions", body = ListResponse<StepExecution>),
        (status = 404, description = "Phase not found in batch"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn list_phase_steps(
    State(state): State<AppState>,
    Path((batch_id, phase_execution_id)): Path<(i64, i64)>,
) -> Result<Json<ListResponse<StepExecution>>, ApiError> {
    let phase = state
        .db
        .get_phase(phase_execution_id)
        .await?
        .filter(|p| p.batch_id == batch_id)
        .ok_or_else(|| {
            ApiError::not_found(format!("phase {phase_execution_id} in batch {batch_id}"))
        })?;

    let rows = state.db.list_steps_for_phase(phase.id).await?;
    Ok(Json(
        rows.into_iter().map(to_step).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/batches/:batch_id/inits - The batch's init executions at its
/// current version
#[utoipa::path(
    get,
    path = "/v1/batches/{batch_id}/inits",
    params(("batch_id" = i64, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Init executions", body = ListResponse<InitExecution>),
        (status = 404, description = "Batch not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "batches"
)]
pub async fn list_inits(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<ListResponse<InitExecution>>, ApiError> {
    let Some(version) = state.db.max_phase_version(batch_id).await? else {
        return Ok(Json(ListResponse::new(Vec::new())));
    };
    let rows = state.db.list_inits(batch_id, version).await?;
    Ok(Json(
        rows.into_iter().map(to_init).collect::<Vec<_>>().into(),
    ))
}

/// Merge explicit rows with CSV-parsed rows, validating the CSV against the
/// runbook's required columns.
async fn collect_member_rows(
    state: &AppState,
    runbook_name: &str,
    mut rows: Vec<BTreeMap<String, String>>,
    csv: Option<&str>,
) -> Result<(Vec<BTreeMap<String, String>>, Vec<String>), ApiError> {
    let mut warnings = Vec::new();
    if let Some(csv) = csv {
        let runbook = state
            .db
            .get_active_runbook(runbook_name)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("runbook {runbook_name}")))?;
        let spec: cutover_core::RunbookSpec = serde_json::from_value(runbook.spec)
            .map_err(|e| ApiError::internal(format!("stored spec unparseable: {e}")))?;

        let (csv_rows, csv_warnings) = ManualBatchService::ingest_csv(&spec, csv)?;
        rows.extend(csv_rows);
        warnings = csv_warnings;
    }
    Ok((rows, warnings))
}

pub(crate) fn to_batch(row: BatchRow) -> Batch {
    Batch {
        id: row.id,
        runbook_name: row.runbook_name,
        batch_start_time: row.batch_start_time,
        status: row
            .status
            .parse()
            .unwrap_or(cutover_contracts::BatchStatus::Detected),
        is_manual: row.is_manual,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn to_member(row: BatchMemberRow) -> BatchMember {
    BatchMember {
        id: row.id,
        batch_id: row.batch_id,
        member_key: row.member_key,
        status: row
            .status
            .parse()
            .unwrap_or(cutover_contracts::MemberStatus::Active),
        data: row.data_json,
        worker_data: row.worker_data_json,
        add_dispatched_at: row.add_dispatched_at,
        remove_dispatched_at: row.remove_dispatched_at,
        created_at: row.created_at,
    }
}

fn to_phase(row: PhaseExecutionRow) -> PhaseExecution {
    PhaseExecution {
        id: row.id,
        batch_id: row.batch_id,
        phase_name: row.phase_name,
        runbook_version: row.runbook_version,
        offset_minutes: row.offset_minutes,
        due_at: row.due_at,
        status: row
            .status
            .parse()
            .unwrap_or(cutover_contracts::PhaseStatus::Pending),
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn to_step(row: StepExecutionRow) -> StepExecution {
    StepExecution {
        id: row.id,
        phase_execution_id: row.phase_execution_id,
        batch_id: row.batch_id,
        member_id: row.member_id,
        step_index: row.step_index,
        step_name: row.step_name,
        worker_id: row.worker_id,
        function_name: row.function_name,
        status: row
            .status
            .parse()
            .unwrap_or(cutover_contracts::StepStatus::Pending),
        retry_count: row.retry_count,
        max_retries: row.max_retries,
        error_message: row.error_message,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn to_init(row: InitExecutionRow) -> InitExecution {
    InitExecution {
        id: row.id,
        batch_id: row.batch_id,
        runbook_version: row.runbook_version,
        step_index: row.step_index,
        step_name: row.step_name,
        worker_id: row.worker_id,
        function_name: row.function_name,
        status: row
            .status
            .parse()
            .unwrap_or(cutover_contracts::StepStatus::Pending),
        retry_count: row.retry_count,
        max_retries: row.max_retries,
        error_message: row.error_message,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}
