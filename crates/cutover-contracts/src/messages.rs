// Bus message payloads
//
// Two message families flow through the bus: internal engine events
// (scheduler → orchestrator, orchestrator → itself for retry/poll timing) and
// the worker job/result exchange. Correlation data on a job is echoed back
// verbatim by the worker so the result handler can re-locate the owning row.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subject carrying internal engine events
pub const EVENTS_SUBJECT: &str = "engine.events";

/// Subject carrying worker results back into the orchestrator
pub const RESULTS_SUBJECT: &str = "engine.results";

/// Routing subject for jobs destined for one worker pool
pub fn worker_subject(worker_id: &str) -> String {
    format!("worker.{worker_id}")
}

/// Reference to the execution row a poll/retry event targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionRef {
    Step { step_execution_id: i64 },
    Init { init_execution_id: i64 },
}

/// Internal scheduling events consumed by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// A batch with init steps was created or its init must re-run
    BatchInit {
        runbook_name: String,
        runbook_version: i32,
        batch_id: i64,
    },

    /// A phase's due time arrived
    PhaseDue {
        runbook_name: String,
        runbook_version: i32,
        batch_id: i64,
        phase_execution_id: i64,
        phase_name: String,
        offset_minutes: i64,
        due_at: DateTime<Utc>,
        /// Active members at dispatch time
        member_ids: Vec<i64>,
    },

    /// A member joined a live batch
    MemberAdded {
        runbook_name: String,
        batch_id: i64,
        member_id: i64,
    },

    /// A member left a live batch
    MemberRemoved {
        runbook_name: String,
        batch_id: i64,
        member_id: i64,
    },

    /// Re-issue a polling job if its interval elapsed
    PollCheck { target: ExecutionRef },

    /// Scheduled retry of a failed execution
    RetryCheck { target: ExecutionRef },
}

impl EngineEvent {
    /// Short name used in logs and message kinds.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::BatchInit { .. } => "batch-init",
            EngineEvent::PhaseDue { .. } => "phase-due",
            EngineEvent::MemberAdded { .. } => "member-added",
            EngineEvent::MemberRemoved { .. } => "member-removed",
            EngineEvent::PollCheck { .. } => "poll-check",
            EngineEvent::RetryCheck { .. } => "retry-check",
        }
    }
}

/// Correlation payload attached to every outgoing worker job and echoed back
/// on the result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationData {
    pub runbook_name: String,
    pub runbook_version: i32,
    pub is_init_step: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_execution_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_execution_id: Option<i64>,
}

impl CorrelationData {
    pub fn for_step(runbook_name: impl Into<String>, runbook_version: i32, id: i64) -> Self {
        Self {
            runbook_name: runbook_name.into(),
            runbook_version,
            is_init_step: false,
            step_execution_id: Some(id),
            init_execution_id: None,
        }
    }

    pub fn for_init(runbook_name: impl Into<String>, runbook_version: i32, id: i64) -> Self {
        Self {
            runbook_name: runbook_name.into(),
            runbook_version,
            is_init_step: true,
            step_execution_id: None,
            init_execution_id: Some(id),
        }
    }

    /// Correlation for fire-and-forget jobs (rollback, member-removed
    /// notifications): the result handler drops results that carry no
    /// execution id.
    pub fn untracked(runbook_name: impl Into<String>, runbook_version: i32) -> Self {
        Self {
            runbook_name: runbook_name.into(),
            runbook_version,
            is_init_step: false,
            step_execution_id: None,
            init_execution_id: None,
        }
    }

    /// The execution row this correlation points at, if well-formed.
    pub fn execution_ref(&self) -> Option<ExecutionRef> {
        if self.is_init_step {
            self.init_execution_id
                .map(|init_execution_id| ExecutionRef::Init { init_execution_id })
        } else {
            self.step_execution_id
                .map(|step_execution_id| ExecutionRef::Step { step_execution_id })
        }
    }
}

/// A job published to a worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub job_id: Uuid,
    pub batch_id: i64,
    pub function_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub correlation_data: CorrelationData,
}

/// Terminal status reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerResultStatus {
    Success,
    Failure,
}

/// Error detail on a failed worker result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerError {
    pub message: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

/// A result message returned by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub job_id: Uuid,
    pub status: WorkerResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// True while a long-running operation is still in progress
    #[serde(default)]
    pub is_polling_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
    pub correlation_data: CorrelationData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_names_are_kebab_case() {
        let event = EngineEvent::BatchInit {
            runbook_name: "rb".to_string(),
            runbook_version: 1,
            batch_id: 7,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"batch-init\""));
        assert_eq!(event.kind(), "batch-init");

        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_poll_check_round_trip() {
        let event = EngineEvent::PollCheck {
            target: ExecutionRef::Step {
                step_execution_id: 42,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_correlation_execution_ref() {
        let step = CorrelationData::for_step("rb", 2, 5);
        assert_eq!(
            step.execution_ref(),
            Some(ExecutionRef::Step {
                step_execution_id: 5
            })
        );

        let init = CorrelationData::for_init("rb", 2, 9);
        assert_eq!(
            init.execution_ref(),
            Some(ExecutionRef::Init {
                init_execution_id: 9
            })
        );

        // Mismatched payloads yield no target rather than the wrong one
        let broken = CorrelationData {
            is_init_step: true,
            init_execution_id: None,
            ..CorrelationData::for_step("rb", 2, 5)
        };
        assert_eq!(broken.execution_ref(), None);
    }

    #[test]
    fn test_worker_result_defaults() {
        let raw = json!({
            "job_id": Uuid::now_v7(),
            "status": "success",
            "correlation_data": {
                "runbook_name": "rb",
                "runbook_version": 1,
                "is_init_step": false,
                "step_execution_id": 3
            }
        });
        let result: WorkerResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.status, WorkerResultStatus::Success);
        assert!(!result.is_polling_in_progress);
        assert!(result.result.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_worker_subject() {
        assert_eq!(worker_subject("mailmover"), "worker.mailmover");
    }
}
