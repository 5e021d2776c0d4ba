// Worker result handler
//
// One shared handler branches on the correlation payload's init/step tag.
// Duplicate deliveries hit terminal-status guards and compare-and-set
// transitions that report zero rows, so every result advances its execution
// exactly once.

use chrono::{Duration, Utc};
use cutover_contracts::{
    BatchStatus, EngineEvent, ExecutionRef, StepStatus, WorkerResult, WorkerResultStatus,
};
use cutover_storage::models::{InitExecutionRow, StepExecutionRow};
use tracing::{debug, info, instrument, warn};

use super::{batch_is_live, Orchestrator, LIVE_STATUSES};
use crate::error::Result;
use crate::events;
use crate::steps;

impl Orchestrator {
    /// Handle one worker result message.
    #[instrument(skip(self, result), fields(job_id = %result.job_id))]
    pub async fn handle_worker_result(&self, result: &WorkerResult) -> Result<()> {
        match result.correlation_data.execution_ref() {
            Some(ExecutionRef::Init { init_execution_id }) => {
                self.handle_init_result(result, init_execution_id).await
            }
            Some(ExecutionRef::Step { step_execution_id }) => {
                self.handle_step_result(result, step_execution_id).await
            }
            None => {
                debug!("result without execution correlation dropped");
                Ok(())
            }
        }
    }

    // ============================================
    // Init path
    // ============================================

    async fn handle_init_result(&self, result: &WorkerResult, init_id: i64) -> Result<()> {
        let Some(init) = self.db.get_init(init_id).await? else {
            debug!(init_id, "result for unknown init dropped");
            return Ok(());
        };
        if is_terminal(&init.status) {
            return Ok(());
        }
        let Some(batch) = self.db.get_batch(init.batch_id).await? else {
            return Ok(());
        };

        if result.is_polling_in_progress {
            self.db.mark_init_polling(init.id).await?;
            return Ok(());
        }

        match result.status {
            WorkerResultStatus::Success => {
                if !self
                    .db
                    .mark_init_succeeded(init.id, result.result.as_ref())
                    .await?
                {
                    return Ok(());
                }
                debug!(init_id, step = %init.step_name, "init step succeeded");

                let name = &result.correlation_data.runbook_name;
                let version = result.correlation_data.runbook_version;
                if !self.dispatch_next_init(name, version, batch.id).await? {
                    // Init sequence finished: the batch goes active
                    if self
                        .db
                        .set_batch_status(
                            batch.id,
                            &[BatchStatus::Detected, BatchStatus::InitDispatched],
                            BatchStatus::Active,
                        )
                        .await?
                    {
                        info!(batch_id = batch.id, "batch active");
                    }
                }
                Ok(())
            }
            WorkerResultStatus::Failure => {
                let message = failure_message(result);

                if init.retry_count < init.max_retries {
                    if self.db.reset_init_for_retry(init.id, &message).await? {
                        let retry_after =
                            Utc::now() + Duration::seconds(init.retry_interval_sec.unwrap_or(0));
                        events::publish_event_at(
                            self.bus.as_ref(),
                            &EngineEvent::RetryCheck {
                                target: ExecutionRef::Init {
                                    init_execution_id: init.id,
                                },
                            },
                            retry_after,
                        )
                        .await?;
                        debug!(init_id, %retry_after, "init retry scheduled");
                    }
                    return Ok(());
                }

                if self.db.mark_init_failed(init.id, &message).await? {
                    warn!(init_id, batch_id = batch.id, "init step failed: {message}");
                    self.fail_batch_for_init(&init, result).await?;
                }
                Ok(())
            }
        }
    }

    /// Terminal init failure: the batch fails, rollback fires if configured.
    async fn fail_batch_for_init(
        &self,
        init: &InitExecutionRow,
        result: &WorkerResult,
    ) -> Result<()> {
        let Some(batch) = self.db.get_batch(init.batch_id).await? else {
            return Ok(());
        };
        self.db
            .set_batch_status(batch.id, &LIVE_STATUSES, BatchStatus::Failed)
            .await?;

        if let Some(reference) = &init.on_failure {
            let name = &result.correlation_data.runbook_name;
            let version = result.correlation_data.runbook_version;
            let spec = self.load_spec(name, version).await?;
            self.trigger_rollback(&spec, version, &batch, reference, None)
                .await?;
        }
        Ok(())
    }

    // ============================================
    // Step path
    // ============================================

    async fn handle_step_result(&self, result: &WorkerResult, step_id: i64) -> Result<()> {
        let Some(step) = self.db.get_step(step_id).await? else {
            debug!(step_id, "result for unknown step dropped");
            return Ok(());
        };
        if is_terminal(&step.status) {
            return Ok(());
        }
        let Some(batch) = self.db.get_batch(step.batch_id).await? else {
            return Ok(());
        };
        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };

        if result.is_polling_in_progress {
            self.db.mark_step_polling(step.id).await?;
            return Ok(());
        }

        let name = result.correlation_data.runbook_name.clone();
        let version = result.correlation_data.runbook_version;

        match result.status {
            WorkerResultStatus::Success => {
                if !self
                    .db
                    .mark_step_succeeded(step.id, result.result.as_ref())
                    .await?
                {
                    return Ok(());
                }
                debug!(step_id, step = %step.step_name, "step succeeded");

                self.extract_output_params(&step, result).await?;

                // Per-member progression: this member's current index is
                // done, so its next index (if any) dispatches now.
                let rows = self.db.list_steps_for_phase(phase.id).await?;
                let next_index = rows
                    .iter()
                    .filter(|r| r.member_id == step.member_id && r.step_index > step.step_index)
                    .filter(|r| r.status.parse::<StepStatus>() == Ok(StepStatus::Pending))
                    .map(|r| r.step_index)
                    .min();

                match next_index {
                    Some(index) => {
                        for row in rows.iter().filter(|r| {
                            r.member_id == step.member_id
                                && r.step_index == index
                                && r.status.parse::<StepStatus>() == Ok(StepStatus::Pending)
                        }) {
                            let job = steps::job_for_step(row, &name, version);
                            if self.db.mark_step_dispatched(row.id, job.job_id).await? {
                                self.dispatcher.dispatch(job).await?;
                            }
                        }
                    }
                    None => {
                        // Member finished the phase; settle it when everyone
                        // else has too.
                        self.evaluate_phase_progress(&phase, &batch).await?;
                    }
                }
                Ok(())
            }
            WorkerResultStatus::Failure => {
                let message = failure_message(result);

                if step.retry_count < step.max_retries {
                    if self.db.reset_step_for_retry(step.id, &message).await? {
                        let retry_after =
                            Utc::now() + Duration::seconds(step.retry_interval_sec.unwrap_or(0));
                        events::publish_event_at(
                            self.bus.as_ref(),
                            &EngineEvent::RetryCheck {
                                target: ExecutionRef::Step {
                                    step_execution_id: step.id,
                                },
                            },
                            retry_after,
                        )
                        .await?;
                        debug!(step_id, %retry_after, "step retry scheduled");
                    }
                    return Ok(());
                }

                if self.db.mark_step_failed(step.id, &message).await? {
                    warn!(step_id, member_id = step.member_id, "step failed: {message}");
                    self.settle_failed_step(&step, &name, version).await?;
                }
                Ok(())
            }
        }
    }

    /// Merge declared output params from the result payload into the
    /// member's worker data.
    async fn extract_output_params(
        &self,
        step: &StepExecutionRow,
        result: &WorkerResult,
    ) -> Result<()> {
        let declared = step.output_param_map();
        if declared.is_empty() {
            return Ok(());
        }
        let Some(object) = result.result.as_ref().and_then(|v| v.as_object()) else {
            return Ok(());
        };

        let mut patch = serde_json::Map::new();
        for (output_key, result_field) in &declared {
            if let Some(value) = object.get(result_field) {
                patch.insert(output_key.clone(), value.clone());
            }
        }
        if !patch.is_empty() {
            self.db
                .merge_worker_data(step.member_id, &serde_json::Value::Object(patch))
                .await?;
        }
        Ok(())
    }

    /// Shared terminal-failure path for steps: rollback if configured,
    /// cancel the member's remaining pending steps in the phase, and settle
    /// the phase if nothing is left open. Also used by poll timeouts.
    pub(crate) async fn settle_failed_step(
        &self,
        step: &StepExecutionRow,
        runbook_name: &str,
        runbook_version: i32,
    ) -> Result<()> {
        let Some(batch) = self.db.get_batch(step.batch_id).await? else {
            return Ok(());
        };
        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };

        if let Some(reference) = &step.on_failure {
            let spec = self.load_spec(runbook_name, runbook_version).await?;
            let member = self.db.get_member(step.member_id).await?;
            self.trigger_rollback(&spec, runbook_version, &batch, reference, member.as_ref())
                .await?;
        }

        self.db
            .cancel_pending_member_steps(phase.id, step.member_id)
            .await?;

        if batch_is_live(&batch) {
            self.evaluate_phase_progress(&phase, &batch).await?;
        }
        Ok(())
    }
}

fn is_terminal(status: &str) -> bool {
    status
        .parse::<StepStatus>()
        .map(|s| s.is_terminal())
        .unwrap_or(false)
}

fn failure_message(result: &WorkerResult) -> String {
    result
        .error
        .as_ref()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "worker reported failure".to_string())
}
