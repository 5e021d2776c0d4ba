// poll-check / retry-check handlers
//
// Poll checks are re-sent by the scheduler at poll-interval cadence and
// either re-issue the same job (same job id, same worker) or time the
// execution out. Retry checks arrive via scheduled bus delivery and consume
// one unit of retry budget.

use chrono::{Duration, Utc};
use cutover_contracts::{BatchStatus, ExecutionRef};
use tracing::{debug, instrument, warn};

use super::{Orchestrator, LIVE_STATUSES};
use crate::error::Result;
use crate::steps;

impl Orchestrator {
    #[instrument(skip(self))]
    pub(crate) async fn handle_poll_check(&self, target: ExecutionRef) -> Result<()> {
        match target {
            ExecutionRef::Step { step_execution_id } => {
                self.poll_check_step(step_execution_id).await
            }
            ExecutionRef::Init { init_execution_id } => {
                self.poll_check_init(init_execution_id).await
            }
        }
    }

    async fn poll_check_step(&self, step_id: i64) -> Result<()> {
        let Some(step) = self.db.get_step(step_id).await? else {
            return Ok(());
        };
        if step.status != "polling" {
            return Ok(());
        }

        let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
            return Ok(());
        };
        let Some(batch) = self.db.get_batch(step.batch_id).await? else {
            return Ok(());
        };

        let timed_out = match (step.poll_started_at, step.poll_timeout_sec) {
            (Some(started), Some(timeout)) => started + Duration::seconds(timeout) < Utc::now(),
            _ => false,
        };

        if timed_out {
            if self.db.mark_step_poll_timeout(step.id).await? {
                warn!(step_id, step = %step.step_name, "step timed out while polling");
                self.settle_failed_step(&step, &batch.runbook_name, phase.runbook_version)
                    .await?;
            }
            return Ok(());
        }

        // Re-issue the same job to the same worker, keeping the job id so
        // the worker treats it as a status probe rather than new work.
        if self.db.mark_step_polling(step.id).await? {
            let mut job = steps::job_for_step(&step, &batch.runbook_name, phase.runbook_version);
            if let Some(job_id) = step.last_job_id {
                job = job.with_job_id(job_id);
            }
            self.dispatcher.dispatch(job).await?;
            debug!(step_id, "re-issued polling job");
        }
        Ok(())
    }

    async fn poll_check_init(&self, init_id: i64) -> Result<()> {
        let Some(init) = self.db.get_init(init_id).await? else {
            return Ok(());
        };
        if init.status != "polling" {
            return Ok(());
        }
        let Some(batch) = self.db.get_batch(init.batch_id).await? else {
            return Ok(());
        };

        let timed_out = match (init.poll_started_at, init.poll_timeout_sec) {
            (Some(started), Some(timeout)) => started + Duration::seconds(timeout) < Utc::now(),
            _ => false,
        };

        if timed_out {
            if self.db.mark_init_poll_timeout(init.id).await? {
                warn!(init_id, step = %init.step_name, "init timed out while polling");
                self.db
                    .set_batch_status(batch.id, &LIVE_STATUSES, BatchStatus::Failed)
                    .await?;

                if let Some(reference) = &init.on_failure {
                    let spec = self
                        .load_spec(&batch.runbook_name, init.runbook_version)
                        .await?;
                    self.trigger_rollback(&spec, init.runbook_version, &batch, reference, None)
                        .await?;
                }
            }
            return Ok(());
        }

        if self.db.mark_init_polling(init.id).await? {
            let mut job = steps::job_for_init(&init, &batch.runbook_name);
            if let Some(job_id) = init.last_job_id {
                job = job.with_job_id(job_id);
            }
            self.dispatcher.dispatch(job).await?;
            debug!(init_id, "re-issued polling init job");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub(crate) async fn handle_retry_check(&self, target: ExecutionRef) -> Result<()> {
        match target {
            ExecutionRef::Step { step_execution_id } => {
                let Some(step) = self.db.get_step(step_execution_id).await? else {
                    return Ok(());
                };
                if step.status != "pending" || step.retry_count >= step.max_retries {
                    return Ok(());
                }
                let Some(phase) = self.db.get_phase(step.phase_execution_id).await? else {
                    return Ok(());
                };
                let Some(batch) = self.db.get_batch(step.batch_id).await? else {
                    return Ok(());
                };

                // Fresh job id: the previous attempt's late results must not
                // be mistaken for this one's.
                let job = steps::job_for_step(&step, &batch.runbook_name, phase.runbook_version);
                if self
                    .db
                    .redispatch_step_retry(step.id, job.job_id)
                    .await?
                {
                    self.dispatcher.dispatch(job).await?;
                    debug!(step_id = step.id, retry = step.retry_count + 1, "step retried");
                }
                Ok(())
            }
            ExecutionRef::Init { init_execution_id } => {
                let Some(init) = self.db.get_init(init_execution_id).await? else {
                    return Ok(());
                };
                if init.status != "pending" || init.retry_count >= init.max_retries {
                    return Ok(());
                }
                let Some(batch) = self.db.get_batch(init.batch_id).await? else {
                    return Ok(());
                };

                let job = steps::job_for_init(&init, &batch.runbook_name);
                if self.db.redispatch_init_retry(init.id, job.job_id).await? {
                    self.dispatcher.dispatch(job).await?;
                    debug!(init_id = init.id, retry = init.retry_count + 1, "init retried");
                }
                Ok(())
            }
        }
    }
}
