// Cutover admin API server
//
// Hosts the admin surface and runs the scheduler and orchestrator in-process.
// Multiple instances are safe: scheduler ticks are serialized by the
// distributed lease and orchestrator handlers are idempotent.

mod auth;
mod batches;
mod common;
mod runbooks;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use cutover_bus::PostgresBus;
use cutover_contracts::*;
use cutover_engine::datasource::business::{BusinessDbClient, BusinessDbConfig};
use cutover_engine::datasource::warehouse::{WarehouseClient, WarehouseConfig};
use cutover_engine::{
    DataSourceRegistry, ManualBatchService, Orchestrator, OrchestratorConfig, Scheduler,
    SchedulerConfig,
};
use cutover_storage::Database;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        runbooks::publish_runbook,
        runbooks::list_runbooks,
        runbooks::get_runbook,
        runbooks::list_versions,
        runbooks::csv_template,
        runbooks::set_automation,
        batches::create_batch,
        batches::list_batches,
        batches::get_batch,
        batches::advance_batch,
        batches::cancel_batch,
        batches::list_members,
        batches::add_members,
        batches::remove_members,
        batches::list_phases,
        batches::list_phase_steps,
        batches::list_inits,
    ),
    components(
        schemas(
            Runbook, Batch, BatchMember, PhaseExecution, StepExecution, InitExecution,
            BatchStatus, MemberStatus, PhaseStatus, StepStatus,
            OperationOutcome,
            common::ErrorBody,
            runbooks::PublishRunbookRequest,
            runbooks::SetAutomationRequest,
            batches::CreateBatchRequest,
            batches::AddMembersRequest,
            batches::RemoveMembersRequest,
        )
    ),
    tags(
        (name = "runbooks", description = "Runbook publishing and inspection"),
        (name = "batches", description = "Batch operations and audit trail")
    ),
    info(
        title = "Cutover API",
        version = "0.2.0",
        description = "Admin surface for the cutover migration workflow engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

/// Data-source clients declared via `CUTOVER_WAREHOUSE_CONNECTIONS` and
/// `CUTOVER_BUSINESSDB_CONNECTIONS` (comma-separated connection labels, each
/// with its own URL/token environment variables).
fn build_registry() -> Result<DataSourceRegistry> {
    let mut registry = DataSourceRegistry::new();

    if let Ok(labels) = std::env::var("CUTOVER_WAREHOUSE_CONNECTIONS") {
        for label in labels.split(',').map(str::trim).filter(|l| !l.is_empty()) {
            let config = WarehouseConfig::from_env(label)
                .with_context(|| format!("warehouse connection {label}"))?;
            registry = registry.register(label, Arc::new(WarehouseClient::new(config)));
            tracing::info!(connection = label, "registered warehouse connection");
        }
    }
    if let Ok(labels) = std::env::var("CUTOVER_BUSINESSDB_CONNECTIONS") {
        for label in labels.split(',').map(str::trim).filter(|l| !l.is_empty()) {
            let config = BusinessDbConfig::from_env(label)
                .with_context(|| format!("business-db connection {label}"))?;
            registry = registry.register(label, Arc::new(BusinessDbClient::new(config)));
            tracing::info!(connection = label, "registered business-db connection");
        }
    }

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cutover=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("cutover-api starting...");

    // Initialize database
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let db = Database::from_url(&database_url)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to apply migrations")?;
    tracing::info!("Connected to database");

    let bus = Arc::new(PostgresBus::new(db.pool().clone()));
    let registry = build_registry()?;
    let manual = ManualBatchService::new(db.clone(), bus.clone());

    // Background engine tasks
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        db.clone(),
        bus.clone(),
        registry,
        SchedulerConfig::default(),
    );
    let orchestrator = Orchestrator::new(db.clone(), bus.clone(), OrchestratorConfig::default());
    let scheduler_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };
    let orchestrator_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(cancel).await })
    };

    // Auth is declarative per route group and enforced by middleware
    let auth_config = auth::AuthConfig::from_env();
    if auth_config.mode == auth::AuthMode::None {
        tracing::warn!("authentication disabled (CUTOVER_AUTH_MODE=none)");
    }
    let auth_state = auth::AuthState::new(&auth_config);

    let db = Arc::new(db);
    let runbooks_state = runbooks::AppState {
        db: db.clone(),
        manual: manual.clone(),
    };
    let batches_state = batches::AppState {
        db: db.clone(),
        manual,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .merge(runbooks::routes(runbooks_state, auth_state.clone()))
        .merge(batches::routes(batches_state, auth_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = std::env::var("CUTOVER_BIND").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    let _ = scheduler_task.await;
    let _ = orchestrator_task.await;

    Ok(())
}
