// phase-due handler
//
// Materializes step executions for every active member of the batch, then
// advances exactly one step index. Later indices are driven by the result
// handler as members complete their current step.

use std::collections::HashSet;

use cutover_contracts::{PhaseStatus, StepStatus};
use cutover_storage::models::{BatchRow, NewStepExecution, PhaseExecutionRow};
use tracing::{debug, instrument, warn};

use super::{batch_is_live, Orchestrator};
use crate::error::Result;
use crate::steps;

impl Orchestrator {
    #[instrument(skip(self))]
    pub(crate) async fn handle_phase_due(
        &self,
        runbook_name: &str,
        runbook_version: i32,
        batch_id: i64,
        phase_execution_id: i64,
    ) -> Result<()> {
        let Some(batch) = self.db.get_batch(batch_id).await? else {
            debug!(batch_id, "phase-due for unknown batch dropped");
            return Ok(());
        };
        if !batch_is_live(&batch) {
            return Ok(());
        }

        let Some(phase) = self.db.get_phase(phase_execution_id).await? else {
            debug!(phase_execution_id, "phase-due for unknown phase dropped");
            return Ok(());
        };
        match phase.status.parse::<PhaseStatus>() {
            // Pending happens when the event outruns the publisher's own
            // status transition; everything settled is a duplicate delivery.
            Ok(PhaseStatus::Dispatched) | Ok(PhaseStatus::Pending) => {}
            _ => return Ok(()),
        }

        let spec = self.load_spec(runbook_name, runbook_version).await?;
        let Some(phase_def) = spec.phase(&phase.phase_name) else {
            warn!(phase = %phase.phase_name, "phase not present in runbook version; nothing to run");
            return Ok(());
        };

        // 1. Create step executions for members that have none yet. A member
        //    whose templates cannot resolve is skipped with a warning; the
        //    phase goes on without it.
        let existing: HashSet<i64> = self
            .db
            .member_ids_with_steps(phase.id)
            .await?
            .into_iter()
            .collect();
        let members = self.db.list_active_members(batch_id).await?;

        let mut new_steps: Vec<NewStepExecution> = Vec::new();
        for member in members.iter().filter(|m| !existing.contains(&m.id)) {
            let map = steps::resolution_map(member);
            let mut resolved = Vec::with_capacity(phase_def.steps.len());
            let mut failed = false;
            for (index, step) in phase_def.steps.iter().enumerate() {
                match steps::resolve_member_step(&spec, step, index as i32, &batch, &map) {
                    Ok(row) => resolved.push(row),
                    Err(e) => {
                        warn!(
                            member_key = %member.member_key,
                            phase = %phase.phase_name,
                            "skipping member, template resolution failed: {e}"
                        );
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                continue;
            }
            for step in resolved {
                new_steps.push(NewStepExecution {
                    phase_execution_id: phase.id,
                    batch_id,
                    member_id: member.id,
                    step,
                });
            }
        }
        if !new_steps.is_empty() {
            self.db.insert_step_executions(&new_steps).await?;
        }

        // 2. Advance one step index (or settle the phase).
        self.advance_phase_steps(&phase, &batch, runbook_name, runbook_version)
            .await
    }

    /// Dispatch every pending row of the first step index that has any,
    /// unless an earlier index still has in-flight rows. With nothing
    /// pending anywhere, settle the phase.
    pub(crate) async fn advance_phase_steps(
        &self,
        phase: &PhaseExecutionRow,
        batch: &BatchRow,
        runbook_name: &str,
        runbook_version: i32,
    ) -> Result<()> {
        let rows = self.db.list_steps_for_phase(phase.id).await?;

        let first_pending = rows
            .iter()
            .filter(|r| r.status.parse::<StepStatus>() == Ok(StepStatus::Pending))
            .map(|r| r.step_index)
            .min();

        let Some(index) = first_pending else {
            return self.evaluate_phase_progress(phase, batch).await;
        };

        let earlier_in_flight = rows.iter().any(|r| {
            r.step_index < index
                && matches!(
                    r.status.parse::<StepStatus>(),
                    Ok(StepStatus::Dispatched | StepStatus::Polling)
                )
        });
        if earlier_in_flight {
            debug!(phase_id = phase.id, index, "waiting for earlier step index");
            return Ok(());
        }

        // One job per pending member at this index, published in parallel
        let outcomes = futures::future::join_all(
            rows.iter()
                .filter(|r| r.step_index == index)
                .filter(|r| r.status.parse::<StepStatus>() == Ok(StepStatus::Pending))
                .map(|row| {
                    let job = steps::job_for_step(row, runbook_name, runbook_version);
                    async move {
                        if self.db.mark_step_dispatched(row.id, job.job_id).await? {
                            self.dispatcher.dispatch(job).await?;
                            Ok::<bool, crate::error::EngineError>(true)
                        } else {
                            Ok(false)
                        }
                    }
                }),
        )
        .await;

        let mut dispatched = 0;
        for outcome in outcomes {
            if outcome? {
                dispatched += 1;
            }
        }

        debug!(phase_id = phase.id, index, dispatched, "advanced step index");
        Ok(())
    }
}
