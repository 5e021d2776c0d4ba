// Runbook publishing and inspection routes

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use cutover_contracts::{ListResponse, Runbook};
use cutover_core::RunbookSpec;
use cutover_engine::ManualBatchService;
use cutover_storage::models::{PublishRunbook, RunbookRow};
use cutover_storage::Database;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::auth::{require_admin, require_auth, AuthState};
use crate::common::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub manual: ManualBatchService,
}

/// Request to publish a new runbook version
#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishRunbookRequest {
    /// The runbook specification document
    pub spec: serde_json::Value,
    /// `catch_up` (default) or `ignore`
    #[serde(default)]
    pub overdue_behavior: Option<String>,
    /// Re-run init steps when a live batch transitions to this version
    #[serde(default)]
    pub rerun_init: bool,
}

/// Request to toggle scheduler automation
#[derive(Debug, Deserialize, ToSchema)]
pub struct SetAutomationRequest {
    pub enabled: bool,
}

/// Create runbook routes with their authorization requirements
pub fn routes(state: AppState, auth: AuthState) -> Router {
    Router::new()
        .route(
            "/v1/runbooks",
            post(publish_runbook)
                .route_layer(from_fn_with_state(auth.clone(), require_admin))
                .get(list_runbooks),
        )
        .route(
            "/v1/runbooks/:name/automation",
            post(set_automation).route_layer(from_fn_with_state(auth.clone(), require_admin)),
        )
        .route("/v1/runbooks/:name", get(get_runbook))
        .route("/v1/runbooks/:name/versions", get(list_versions))
        .route("/v1/runbooks/:name/csv-template", get(csv_template))
        .route_layer(from_fn_with_state(auth, require_auth))
        .with_state(state)
}

/// POST /v1/runbooks - Publish a new immutable runbook version
#[utoipa::path(
    post,
    path = "/v1/runbooks",
    request_body = PublishRunbookRequest,
    responses(
        (status = 201, description = "Runbook version published", body = Runbook),
        (status = 400, description = "Specification failed validation"),
        (status = 500, description = "Internal server error")
    ),
    tag = "runbooks"
)]
pub async fn publish_runbook(
    State(state): State<AppState>,
    Json(req): Json<PublishRunbookRequest>,
) -> Result<(StatusCode, Json<Runbook>), ApiError> {
    // Validate the document before anything is persisted
    let spec = RunbookSpec::parse(&req.spec.to_string())?;

    let overdue_behavior = req
        .overdue_behavior
        .unwrap_or_else(|| "catch_up".to_string());
    overdue_behavior
        .parse::<cutover_core::OverdueBehavior>()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let row = state
        .db
        .publish_runbook(PublishRunbook {
            name: spec.name.clone(),
            spec: req.spec,
            overdue_behavior,
            rerun_init: req.rerun_init,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(to_runbook(row))))
}

/// GET /v1/runbooks - List active runbook versions
#[utoipa::path(
    get,
    path = "/v1/runbooks",
    responses(
        (status = 200, description = "Active runbooks", body = ListResponse<Runbook>),
        (status = 500, description = "Internal server error")
    ),
    tag = "runbooks"
)]
pub async fn list_runbooks(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Runbook>>, ApiError> {
    let rows = state.db.list_active_runbooks().await?;
    Ok(Json(
        rows.into_iter().map(to_runbook).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/runbooks/:name - The active version of a runbook
#[utoipa::path(
    get,
    path = "/v1/runbooks/{name}",
    params(("name" = String, Path, description = "Runbook name")),
    responses(
        (status = 200, description = "Active runbook version", body = Runbook),
        (status = 404, description = "Runbook not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "runbooks"
)]
pub async fn get_runbook(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Runbook>, ApiError> {
    let row = state
        .db
        .get_active_runbook(&name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("runbook {name}")))?;
    Ok(Json(to_runbook(row)))
}

/// GET /v1/runbooks/:name/versions - Every published version
#[utoipa::path(
    get,
    path = "/v1/runbooks/{name}/versions",
    params(("name" = String, Path, description = "Runbook name")),
    responses(
        (status = 200, description = "Published versions", body = ListResponse<Runbook>),
        (status = 500, description = "Internal server error")
    ),
    tag = "runbooks"
)]
pub async fn list_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ListResponse<Runbook>>, ApiError> {
    let rows = state.db.list_runbook_versions(&name).await?;
    Ok(Json(
        rows.into_iter().map(to_runbook).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/runbooks/:name/csv-template - CSV upload template
#[utoipa::path(
    get,
    path = "/v1/runbooks/{name}/csv-template",
    params(("name" = String, Path, description = "Runbook name")),
    responses(
        (status = 200, description = "CSV template", body = String, content_type = "text/csv"),
        (status = 404, description = "Runbook not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "runbooks"
)]
pub async fn csv_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<([(axum::http::HeaderName, &'static str); 1], String), ApiError> {
    let template = state.manual.csv_template(&name).await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/csv")],
        template,
    ))
}

/// POST /v1/runbooks/:name/automation - Enable or disable the scheduler for
/// a runbook
#[utoipa::path(
    post,
    path = "/v1/runbooks/{name}/automation",
    params(("name" = String, Path, description = "Runbook name")),
    request_body = SetAutomationRequest,
    responses(
        (status = 200, description = "Automation toggled", body = Runbook),
        (status = 404, description = "Runbook not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "runbooks"
)]
pub async fn set_automation(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetAutomationRequest>,
) -> Result<Json<Runbook>, ApiError> {
    if !state.db.set_automation_enabled(&name, req.enabled).await? {
        return Err(ApiError::not_found(format!("runbook {name}")));
    }
    let row = state
        .db
        .get_active_runbook(&name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("runbook {name}")))?;
    Ok(Json(to_runbook(row)))
}

pub(crate) fn to_runbook(row: RunbookRow) -> Runbook {
    Runbook {
        name: row.name,
        version: row.version,
        is_active: row.is_active,
        automation_enabled: row.automation_enabled,
        overdue_behavior: row.overdue_behavior,
        ignore_overdue_applied: row.ignore_overdue_applied,
        rerun_init: row.rerun_init,
        data_table: row.data_table,
        created_at: row.created_at,
    }
}
