// member-added / member-removed handlers
//
// A late joiner is caught up on every phase that already dispatched or
// completed; a removed member has its open steps cancelled and the runbook's
// on_member_removed steps fired as one-shot jobs against its last-known
// snapshot.

use cutover_contracts::{CorrelationData, PhaseStatus, StepStatus};
use cutover_storage::models::NewStepExecution;
use tracing::{debug, instrument, warn};

use super::{batch_is_live, Orchestrator};
use crate::dispatch::JobRequest;
use crate::error::Result;
use crate::steps;

impl Orchestrator {
    /// Catch a late joiner up on the batch's already-started phases.
    #[instrument(skip(self))]
    pub(crate) async fn handle_member_added(&self, batch_id: i64, member_id: i64) -> Result<()> {
        let Some(member) = self.db.get_member(member_id).await? else {
            debug!(member_id, "member-added for unknown member dropped");
            return Ok(());
        };
        if member.status != "active" {
            return Ok(());
        }
        let Some(batch) = self.db.get_batch(batch_id).await? else {
            return Ok(());
        };
        if !batch_is_live(&batch) {
            return Ok(());
        }
        let Some(version) = self.current_batch_version(batch_id).await? else {
            return Ok(());
        };

        let spec = self.load_spec(&batch.runbook_name, version).await?;
        let phases = self.db.list_phases_for_version(batch_id, version).await?;

        // The overdue set for this member: phases that already left pending.
        // Not-yet-due phases pick the member up when they fire.
        let overdue = phases.iter().filter(|p| {
            matches!(
                p.status.parse::<PhaseStatus>(),
                Ok(PhaseStatus::Dispatched | PhaseStatus::Completed)
            )
        });

        let member_map = steps::resolution_map(&member);
        for phase in overdue {
            let Some(phase_def) = spec.phase(&phase.phase_name) else {
                continue;
            };

            let mut resolved = Vec::with_capacity(phase_def.steps.len());
            let mut failed = false;
            for (index, step) in phase_def.steps.iter().enumerate() {
                match steps::resolve_member_step(&spec, step, index as i32, &batch, &member_map) {
                    Ok(row) => resolved.push(row),
                    Err(e) => {
                        warn!(
                            member_key = %member.member_key,
                            phase = %phase.phase_name,
                            "late joiner skipped for phase, template resolution failed: {e}"
                        );
                        failed = true;
                        break;
                    }
                }
            }
            if failed || resolved.is_empty() {
                continue;
            }

            let new_steps: Vec<NewStepExecution> = resolved
                .into_iter()
                .map(|step| NewStepExecution {
                    phase_execution_id: phase.id,
                    batch_id,
                    member_id,
                    step,
                })
                .collect();
            self.db.insert_step_executions(&new_steps).await?;

            // Dispatch the member's first pending index immediately; results
            // drive the rest.
            let rows = self.db.list_steps_for_phase(phase.id).await?;
            let first_pending = rows
                .iter()
                .filter(|r| r.member_id == member_id)
                .filter(|r| r.status.parse::<StepStatus>() == Ok(StepStatus::Pending))
                .map(|r| r.step_index)
                .min();
            if let Some(index) = first_pending {
                for row in rows.iter().filter(|r| {
                    r.member_id == member_id
                        && r.step_index == index
                        && r.status.parse::<StepStatus>() == Ok(StepStatus::Pending)
                }) {
                    let job = steps::job_for_step(row, &batch.runbook_name, version);
                    if self.db.mark_step_dispatched(row.id, job.job_id).await? {
                        self.dispatcher.dispatch(job).await?;
                    }
                }
            }
            debug!(member_id, phase = %phase.phase_name, "late joiner caught up");
        }

        Ok(())
    }

    /// Cancel a removed member's open steps and fire the runbook's
    /// on_member_removed steps as one-shot jobs.
    #[instrument(skip(self))]
    pub(crate) async fn handle_member_removed(&self, batch_id: i64, member_id: i64) -> Result<()> {
        let Some(member) = self.db.get_member(member_id).await? else {
            debug!(member_id, "member-removed for unknown member dropped");
            return Ok(());
        };
        let Some(batch) = self.db.get_batch(batch_id).await? else {
            return Ok(());
        };

        let cancelled = self.db.cancel_open_member_steps(batch_id, member_id).await?;
        debug!(member_id, cancelled, "cancelled steps for removed member");

        let Some(version) = self.current_batch_version(batch_id).await? else {
            return Ok(());
        };
        let spec = self.load_spec(&batch.runbook_name, version).await?;

        // Best-effort notification steps against the last-known snapshot.
        // These jobs carry no execution row; their results are dropped.
        let member_map = steps::resolution_map(&member);
        for step in &spec.on_member_removed {
            match steps::resolve_member_step(&spec, step, 0, &batch, &member_map) {
                Ok(resolved) => {
                    let job = JobRequest::new(
                        batch.id,
                        resolved.worker_id,
                        resolved.function_name,
                        serde_json::from_value(resolved.parameters).unwrap_or_default(),
                        CorrelationData::untracked(&batch.runbook_name, version),
                    );
                    self.dispatcher.dispatch(job).await?;
                }
                Err(e) => {
                    warn!(step = %step.name, "skipping on_member_removed step: {e}");
                }
            }
        }

        // The member's cancellations may have unblocked phase settlement.
        if batch_is_live(&batch) {
            let phases = self.db.list_phases_for_version(batch_id, version).await?;
            for phase in phases
                .iter()
                .filter(|p| p.status.parse::<PhaseStatus>() == Ok(PhaseStatus::Dispatched))
            {
                self.evaluate_phase_progress(phase, &batch).await?;
            }
        }

        Ok(())
    }
}
