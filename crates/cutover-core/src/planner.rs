//! Phase planning
//!
//! Pure decisions about which phase-execution records a batch needs: the
//! initial set for a new batch, and the record set produced by a runbook
//! version transition while the batch is live. The caller owns persistence;
//! this module only returns what to insert and which rows to supersede.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::runbook::RunbookSpec;

/// Policy when a version transition would create a phase whose due time has
/// already passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdueBehavior {
    /// Create the record pending so it fires on the next evaluation
    CatchUp,
    /// Skip overdue phases once, then behave like catch-up
    Ignore,
}

impl std::fmt::Display for OverdueBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CatchUp => write!(f, "catch_up"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

impl std::str::FromStr for OverdueBehavior {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "catch_up" => Ok(Self::CatchUp),
            "ignore" => Ok(Self::Ignore),
            other => Err(CoreError::spec(format!(
                "unknown overdue behavior {other:?}"
            ))),
        }
    }
}

/// Initial status of a planned phase record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedPhaseStatus {
    Pending,
    Skipped,
}

/// A phase-execution record to insert
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPhase {
    pub name: String,
    pub offset_minutes: i64,
    pub due_at: DateTime<Utc>,
    pub initial_status: PlannedPhaseStatus,
}

/// A phase-execution row already persisted for the batch
#[derive(Debug, Clone)]
pub struct ExistingPhase {
    pub id: i64,
    pub name: String,
    pub runbook_version: i32,
    pub is_pending: bool,
}

/// Outcome of planning a version transition
#[derive(Debug, Clone, Default)]
pub struct TransitionPlan {
    /// Records to insert for the new version, in declaration order
    pub new_phases: Vec<PlannedPhase>,
    /// Still-pending records of older versions to mark superseded
    pub supersede_ids: Vec<i64>,
    /// Whether the one-shot ignore-overdue policy was consumed
    pub ignore_overdue_applied: bool,
}

/// Due time of a phase: `batch_start_time − offset`.
pub fn due_at(batch_start: DateTime<Utc>, offset_minutes: i64) -> DateTime<Utc> {
    batch_start - Duration::minutes(offset_minutes)
}

/// Phase records for a freshly detected batch: one pending record per phase,
/// in declaration order.
pub fn plan_new_batch(
    spec: &RunbookSpec,
    batch_start: DateTime<Utc>,
) -> Result<Vec<PlannedPhase>> {
    spec.phases
        .iter()
        .map(|phase| {
            let offset_minutes = phase.offset_minutes()?;
            Ok(PlannedPhase {
                name: phase.name.clone(),
                offset_minutes,
                due_at: due_at(batch_start, offset_minutes),
                initial_status: PlannedPhaseStatus::Pending,
            })
        })
        .collect()
}

/// Plan the record changes for a live batch whose runbook's active version
/// moved to `spec`.
///
/// Phases that already have a record at the new version are left alone, so
/// re-running the transition is a no-op. Overdue phases honor `behavior`;
/// `ignore` is one-shot: once `ignore_already_applied` is set, overdue
/// phases are created pending like catch-up.
pub fn plan_version_transition(
    spec: &RunbookSpec,
    new_version: i32,
    batch_start: DateTime<Utc>,
    now: DateTime<Utc>,
    behavior: OverdueBehavior,
    ignore_already_applied: bool,
    existing: &[ExistingPhase],
) -> Result<TransitionPlan> {
    let mut plan = TransitionPlan::default();

    for phase in &spec.phases {
        let already_recorded = existing
            .iter()
            .any(|e| e.runbook_version == new_version && e.name == phase.name);
        if already_recorded {
            continue;
        }

        let offset_minutes = phase.offset_minutes()?;
        let due = due_at(batch_start, offset_minutes);
        let overdue = due <= now;
        let initial_status = if overdue
            && behavior == OverdueBehavior::Ignore
            && !ignore_already_applied
        {
            plan.ignore_overdue_applied = true;
            PlannedPhaseStatus::Skipped
        } else {
            PlannedPhaseStatus::Pending
        };

        plan.new_phases.push(PlannedPhase {
            name: phase.name.clone(),
            offset_minutes,
            due_at: due,
            initial_status,
        });
    }

    plan.supersede_ids = existing
        .iter()
        .filter(|e| e.is_pending && e.runbook_version != new_version)
        .map(|e| e.id)
        .collect();

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_with_phases(phases: serde_json::Value) -> RunbookSpec {
        let doc = json!({
            "name": "rb",
            "data_source": {
                "type": "sql_warehouse",
                "connection": "wh",
                "query": "SELECT user_id FROM cohort",
                "primary_key": "user_id",
                "batch_time": "immediate"
            },
            "phases": phases
        });
        RunbookSpec::parse(&doc.to_string()).unwrap()
    }

    fn start() -> DateTime<Utc> {
        "2026-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_due_at_subtracts_offset() {
        let due = due_at(start(), 1440);
        assert_eq!(due, "2026-05-31T12:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(due_at(start(), 0), start());
    }

    #[test]
    fn test_plan_new_batch_declaration_order() {
        let spec = spec_with_phases(json!([
            {"name": "prep", "offset": "T-1d", "steps": []},
            {"name": "go", "offset": "T-0", "steps": []},
        ]));
        let phases = plan_new_batch(&spec, start()).unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].name, "prep");
        assert_eq!(phases[0].offset_minutes, 1440);
        assert_eq!(phases[1].name, "go");
        assert!(phases
            .iter()
            .all(|p| p.initial_status == PlannedPhaseStatus::Pending));
    }

    #[test]
    fn test_transition_catch_up_creates_overdue_pending() {
        let spec = spec_with_phases(json!([
            {"name": "late", "offset": "T-1h", "steps": []},
        ]));
        // now is past the phase's due time (start - 1h)
        let now = start();
        let plan = plan_version_transition(
            &spec,
            2,
            start(),
            now,
            OverdueBehavior::CatchUp,
            false,
            &[ExistingPhase {
                id: 10,
                name: "old_phase".to_string(),
                runbook_version: 1,
                is_pending: true,
            }],
        )
        .unwrap();

        assert_eq!(plan.new_phases.len(), 1);
        assert_eq!(plan.new_phases[0].initial_status, PlannedPhaseStatus::Pending);
        assert_eq!(plan.supersede_ids, vec![10]);
        assert!(!plan.ignore_overdue_applied);
    }

    #[test]
    fn test_transition_ignore_skips_once() {
        let spec = spec_with_phases(json!([
            {"name": "late", "offset": "T-1h", "steps": []},
        ]));
        let now = start();

        let plan = plan_version_transition(
            &spec,
            2,
            start(),
            now,
            OverdueBehavior::Ignore,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(plan.new_phases[0].initial_status, PlannedPhaseStatus::Skipped);
        assert!(plan.ignore_overdue_applied);

        // Policy already consumed: overdue phases become pending
        let plan = plan_version_transition(
            &spec,
            3,
            start(),
            now,
            OverdueBehavior::Ignore,
            true,
            &[],
        )
        .unwrap();
        assert_eq!(plan.new_phases[0].initial_status, PlannedPhaseStatus::Pending);
        assert!(!plan.ignore_overdue_applied);
    }

    #[test]
    fn test_transition_future_phase_pending_under_ignore() {
        let spec = spec_with_phases(json!([
            {"name": "future", "offset": "T-0", "steps": []},
        ]));
        let now = "2026-05-30T00:00:00Z".parse().unwrap();
        let plan = plan_version_transition(
            &spec,
            2,
            start(),
            now,
            OverdueBehavior::Ignore,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(plan.new_phases[0].initial_status, PlannedPhaseStatus::Pending);
        assert!(!plan.ignore_overdue_applied);
    }

    #[test]
    fn test_transition_is_idempotent() {
        let spec = spec_with_phases(json!([
            {"name": "go", "offset": "T-0", "steps": []},
        ]));
        let existing = [ExistingPhase {
            id: 5,
            name: "go".to_string(),
            runbook_version: 2,
            is_pending: true,
        }];
        let plan = plan_version_transition(
            &spec,
            2,
            start(),
            start(),
            OverdueBehavior::CatchUp,
            false,
            &existing,
        )
        .unwrap();
        assert!(plan.new_phases.is_empty());
        assert!(plan.supersede_ids.is_empty());
    }

    #[test]
    fn test_overdue_behavior_round_trip() {
        assert_eq!(
            "catch_up".parse::<OverdueBehavior>().unwrap(),
            OverdueBehavior::CatchUp
        );
        assert_eq!(OverdueBehavior::Ignore.to_string(), "ignore");
        assert!("whatever".parse::<OverdueBehavior>().is_err());
    }
}
