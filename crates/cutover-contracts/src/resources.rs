// Resource DTOs for the admin API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::status::{BatchStatus, MemberStatus, PhaseStatus, StepStatus};

/// A published runbook version
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Runbook {
    pub name: String,
    pub version: i32,
    pub is_active: bool,
    pub automation_enabled: bool,
    /// `catch_up` or `ignore`
    pub overdue_behavior: String,
    pub ignore_overdue_applied: bool,
    pub rerun_init: bool,
    /// Name of the per-runbook dynamic data table
    pub data_table: String,
    pub created_at: DateTime<Utc>,
}

/// A cohort of entities sharing one event time
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Batch {
    pub id: i64,
    pub runbook_name: String,
    pub batch_start_time: DateTime<Utc>,
    pub status: BatchStatus,
    pub is_manual: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entity enrolled in a batch
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchMember {
    pub id: i64,
    pub batch_id: i64,
    pub member_key: String,
    pub status: MemberStatus,
    /// Most recent data-source snapshot for this member
    pub data: serde_json::Value,
    /// Values merged from step output params
    pub worker_data: serde_json::Value,
    pub add_dispatched_at: Option<DateTime<Utc>>,
    pub remove_dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One phase of a batch, at one runbook version
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PhaseExecution {
    pub id: i64,
    pub batch_id: i64,
    pub phase_name: String,
    pub runbook_version: i32,
    pub offset_minutes: i64,
    pub due_at: DateTime<Utc>,
    pub status: PhaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step of one member within a phase
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StepExecution {
    pub id: i64,
    pub phase_execution_id: i64,
    pub batch_id: i64,
    pub member_id: i64,
    pub step_index: i32,
    pub step_name: String,
    pub worker_id: String,
    pub function_name: String,
    pub status: StepStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One batch-scoped init step execution
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InitExecution {
    pub id: i64,
    pub batch_id: i64,
    pub runbook_version: i32,
    pub step_index: i32,
    pub step_name: String,
    pub worker_id: String,
    pub function_name: String,
    pub status: StepStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
