// Database models (internal rows, may differ from public DTOs)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// Runbook models
// ============================================

/// Runbook version row from database
#[derive(Debug, Clone, FromRow)]
pub struct RunbookRow {
    pub id: i64,
    pub name: String,
    pub version: i32,
    pub spec: serde_json::Value,
    pub is_active: bool,
    pub automation_enabled: bool,
    pub overdue_behavior: String,
    pub ignore_overdue_applied: bool,
    pub rerun_init: bool,
    pub data_table: String,
    pub created_at: DateTime<Utc>,
}

/// Input for publishing a new runbook version
#[derive(Debug, Clone)]
pub struct PublishRunbook {
    pub name: String,
    pub spec: serde_json::Value,
    pub overdue_behavior: String,
    pub rerun_init: bool,
}

// ============================================
// Batch models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub id: i64,
    pub runbook_name: String,
    pub batch_start_time: DateTime<Utc>,
    pub status: String,
    pub is_manual: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for the single-transaction batch creation of the scheduler and the
/// manual controller
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub runbook_name: String,
    pub runbook_version: i32,
    pub batch_start_time: DateTime<Utc>,
    pub is_manual: bool,
    pub members: Vec<NewMember>,
    pub phases: Vec<NewPhaseExecution>,
    /// Init steps with unresolved `{{_batch_id}}` / `{{_batch_start_time}}`
    /// templates; resolution happens inside the creation transaction once
    /// the batch id is known
    pub inits: Vec<InitStepTemplate>,
}

/// An init step awaiting batch-scoped template resolution
#[derive(Debug, Clone)]
pub struct InitStepTemplate {
    pub step_index: i32,
    pub step_name: String,
    pub worker_id: String,
    /// Function name template (reserved placeholders only)
    pub function: String,
    /// Parameter templates (reserved placeholders only)
    pub params: BTreeMap<String, String>,
    pub poll_interval_sec: Option<i64>,
    pub poll_timeout_sec: Option<i64>,
    pub max_retries: i32,
    pub retry_interval_sec: Option<i64>,
    pub on_failure: Option<String>,
}

// ============================================
// Member models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct BatchMemberRow {
    pub id: i64,
    pub batch_id: i64,
    pub member_key: String,
    pub status: String,
    pub data_json: serde_json::Value,
    pub worker_data_json: serde_json::Value,
    pub add_dispatched_at: Option<DateTime<Utc>>,
    pub remove_dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchMemberRow {
    /// The member's data snapshot as an object map, empty when malformed.
    pub fn data_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.data_json.as_object().cloned().unwrap_or_default()
    }
}

/// Input for inserting (or re-activating) a member
#[derive(Debug, Clone)]
pub struct NewMember {
    pub member_key: String,
    pub data_json: serde_json::Value,
}

// ============================================
// Phase execution models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct PhaseExecutionRow {
    pub id: i64,
    pub batch_id: i64,
    pub phase_name: String,
    pub runbook_version: i32,
    pub offset_minutes: i64,
    pub due_at: DateTime<Utc>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting a phase-execution record
#[derive(Debug, Clone)]
pub struct NewPhaseExecution {
    pub phase_name: String,
    pub runbook_version: i32,
    pub offset_minutes: i64,
    pub due_at: DateTime<Utc>,
    /// `pending` or `skipped` (version transitions under the ignore policy)
    pub status: String,
}

// ============================================
// Step / init execution models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct StepExecutionRow {
    pub id: i64,
    pub phase_execution_id: i64,
    pub batch_id: i64,
    pub member_id: i64,
    pub step_index: i32,
    pub step_name: String,
    pub worker_id: String,
    pub function_name: String,
    pub parameters: serde_json::Value,
    pub status: String,
    pub poll_interval_sec: Option<i64>,
    pub poll_timeout_sec: Option<i64>,
    pub poll_started_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub poll_count: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_interval_sec: Option<i64>,
    pub on_failure: Option<String>,
    pub output_params: serde_json::Value,
    pub last_job_id: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecutionRow {
    /// Resolved parameters as a string map for job dispatch.
    pub fn parameter_map(&self) -> BTreeMap<String, String> {
        json_to_string_map(&self.parameters)
    }

    /// Declared output params (result field → member data key).
    pub fn output_param_map(&self) -> BTreeMap<String, String> {
        json_to_string_map(&self.output_params)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct InitExecutionRow {
    pub id: i64,
    pub batch_id: i64,
    pub runbook_version: i32,
    pub step_index: i32,
    pub step_name: String,
    pub worker_id: String,
    pub function_name: String,
    pub parameters: serde_json::Value,
    pub status: String,
    pub poll_interval_sec: Option<i64>,
    pub poll_timeout_sec: Option<i64>,
    pub poll_started_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub poll_count: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_interval_sec: Option<i64>,
    pub on_failure: Option<String>,
    pub last_job_id: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InitExecutionRow {
    pub fn parameter_map(&self) -> BTreeMap<String, String> {
        json_to_string_map(&self.parameters)
    }
}

/// Input shared by step- and init-execution inserts: a fully resolved unit of
/// work for one worker
#[derive(Debug, Clone)]
pub struct NewExecutionStep {
    pub step_index: i32,
    pub step_name: String,
    pub worker_id: String,
    pub function_name: String,
    pub parameters: serde_json::Value,
    pub poll_interval_sec: Option<i64>,
    pub poll_timeout_sec: Option<i64>,
    pub max_retries: i32,
    pub retry_interval_sec: Option<i64>,
    pub on_failure: Option<String>,
    pub output_params: serde_json::Value,
}

/// Input for inserting one member's step execution under a phase
#[derive(Debug, Clone)]
pub struct NewStepExecution {
    pub phase_execution_id: i64,
    pub batch_id: i64,
    pub member_id: i64,
    pub step: NewExecutionStep,
}

fn json_to_string_map(value: &serde_json::Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}
