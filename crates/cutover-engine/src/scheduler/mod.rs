// Scheduler
//
// Periodic driver pinned to one instance by the `scheduler-tick` lease.
// Every tick enumerates active runbooks, runs their data-source queries,
// maintains the dynamic tables and batch membership, applies version
// transitions, dispatches due phases, and sweeps polling executions.

mod detect;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cutover_bus::MessageBus;
use cutover_contracts::{BatchStatus, EngineEvent, ExecutionRef, PhaseStatus};
use cutover_core::{OverdueBehavior, RunbookSpec};
use cutover_storage::models::RunbookRow;
use cutover_storage::Database;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::datasource::DataSourceRegistry;
use crate::error::Result;
use crate::events::publish_event;
use crate::steps;

/// Lease serializing ticks across instances
const TICK_LEASE: &str = "scheduler-tick";

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between ticks
    pub tick_interval: Duration,
    /// Lease TTL; renewal runs at half this
    pub lease_ttl: Duration,
    /// Safety margin subtracted from the lease TTL for the tick's outer
    /// bound
    pub tick_margin: Duration,
    /// Owner identity for the lease
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(300),
            tick_margin: Duration::from_secs(15),
            instance_id: format!("scheduler-{}", uuid::Uuid::now_v7().simple()),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

/// The scheduler tick driver
pub struct Scheduler {
    pub(crate) db: Database,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) sources: DataSourceRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        db: Database,
        bus: Arc<dyn MessageBus>,
        sources: DataSourceRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            bus,
            sources,
            config,
        }
    }

    /// Tick on a fixed timer until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(instance = %self.config.instance_id, "scheduler started");
        loop {
            if let Err(e) = self.tick(&cancel).await {
                error!("scheduler tick failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!(instance = %self.config.instance_id, "scheduler stopped");
    }

    /// One tick: acquire the lease (silently yielding when another instance
    /// holds it), drive every runbook, sweep polling executions, release.
    #[instrument(skip(self, cancel), fields(instance = %self.config.instance_id))]
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<()> {
        if !self
            .db
            .try_acquire_lease(TICK_LEASE, &self.config.instance_id, self.config.lease_ttl)
            .await?
        {
            debug!("lease held elsewhere, skipping tick");
            return Ok(());
        }

        // Renew on a background task at half the TTL so a long tick does
        // not lose the lease mid-flight.
        let renew_cancel = CancellationToken::new();
        let renew_task = {
            let db = self.db.clone();
            let owner = self.config.instance_id.clone();
            let ttl = self.config.lease_ttl;
            let cancel = renew_cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(ttl / 2) => {
                            match db.renew_lease(TICK_LEASE, &owner, ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!("scheduler lease lost during tick");
                                    break;
                                }
                                Err(e) => warn!("lease renewal failed: {e}"),
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        };

        let bound = self
            .config
            .lease_ttl
            .saturating_sub(self.config.tick_margin);
        let outcome = match tokio::time::timeout(bound, self.run_tick(cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("tick exceeded its outer bound and was cut short");
                Ok(())
            }
        };

        renew_cancel.cancel();
        let _ = renew_task.await;
        // Release tolerates an already-expired or stolen lease
        if let Err(e) = self
            .db
            .release_lease(TICK_LEASE, &self.config.instance_id)
            .await
        {
            warn!("lease release failed: {e}");
        }

        outcome
    }

    async fn run_tick(&self, cancel: &CancellationToken) -> Result<()> {
        let now = Utc::now();

        for runbook in self.db.list_active_runbooks().await? {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !runbook.automation_enabled {
                debug!(runbook = %runbook.name, "automation disabled, skipping");
                continue;
            }
            // A failing runbook must not stall the others; it retries next
            // tick.
            if let Err(e) = self.process_runbook(&runbook, now).await {
                warn!(runbook = %runbook.name, "runbook tick failed: {e}");
            }
        }

        self.sweep_polling(now).await?;
        Ok(())
    }

    /// Detection, membership sync, version transition, init recovery, and
    /// due-phase dispatch for one runbook.
    async fn process_runbook(&self, runbook: &RunbookRow, now: DateTime<Utc>) -> Result<()> {
        let spec: RunbookSpec = serde_json::from_value(runbook.spec.clone())?;

        self.detect_and_sync(runbook, &spec, now).await?;
        self.apply_version_transitions(runbook, &spec, now).await?;
        self.recover_detected_batches(runbook, &spec).await?;
        self.dispatch_due_phases(runbook, now).await?;
        Ok(())
    }

    /// Bring live batches whose phase records predate the active version up
    /// to date (§ phase evaluator version-transition rule).
    async fn apply_version_transitions(
        &self,
        runbook: &RunbookRow,
        spec: &RunbookSpec,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let behavior: OverdueBehavior = runbook
            .overdue_behavior
            .parse()
            .unwrap_or(OverdueBehavior::CatchUp);

        for batch in self.db.list_live_batches(&runbook.name).await? {
            let recorded = self.db.max_phase_version(batch.id).await?;
            if recorded == Some(runbook.version) {
                continue;
            }

            let existing: Vec<cutover_core::ExistingPhase> = self
                .db
                .list_phases(batch.id)
                .await?
                .into_iter()
                .map(|p| cutover_core::ExistingPhase {
                    id: p.id,
                    name: p.phase_name,
                    runbook_version: p.runbook_version,
                    is_pending: p.status == "pending",
                })
                .collect();

            let plan = cutover_core::plan_version_transition(
                spec,
                runbook.version,
                batch.batch_start_time,
                now,
                behavior,
                runbook.ignore_overdue_applied,
                &existing,
            )?;

            let records: Vec<cutover_storage::models::NewPhaseExecution> = plan
                .new_phases
                .iter()
                .map(|p| cutover_storage::models::NewPhaseExecution {
                    phase_name: p.name.clone(),
                    runbook_version: runbook.version,
                    offset_minutes: p.offset_minutes,
                    due_at: p.due_at,
                    status: match p.initial_status {
                        cutover_core::PlannedPhaseStatus::Pending => "pending".to_string(),
                        cutover_core::PlannedPhaseStatus::Skipped => "skipped".to_string(),
                    },
                })
                .collect();
            self.db.insert_phase_executions(batch.id, &records).await?;
            self.db.supersede_pending_phases(&plan.supersede_ids).await?;

            if plan.ignore_overdue_applied {
                self.db
                    .mark_ignore_overdue_applied(&runbook.name, runbook.version)
                    .await?;
            }

            // Re-run init for the new version when requested
            if runbook.rerun_init
                && !spec.init.is_empty()
                && !self
                    .db
                    .has_inits_for_version(batch.id, runbook.version)
                    .await?
            {
                self.db
                    .insert_init_executions(
                        batch.id,
                        runbook.version,
                        &resolved_inits(spec, batch.id, batch.batch_start_time)?,
                    )
                    .await?;
                publish_event(
                    self.bus.as_ref(),
                    &EngineEvent::BatchInit {
                        runbook_name: runbook.name.clone(),
                        runbook_version: runbook.version,
                        batch_id: batch.id,
                    },
                )
                .await?;
                self.db
                    .set_batch_status(
                        batch.id,
                        &[BatchStatus::Active, BatchStatus::Detected],
                        BatchStatus::InitDispatched,
                    )
                    .await?;
            }

            info!(
                batch_id = batch.id,
                version = runbook.version,
                new_phases = plan.new_phases.len(),
                superseded = plan.supersede_ids.len(),
                "applied version transition"
            );
        }
        Ok(())
    }

    /// Move batches stuck in `detected` forward: republish `batch-init` when
    /// init work is outstanding (a lost publish leaves the status untouched,
    /// so this retries it), or activate init-less batches.
    async fn recover_detected_batches(
        &self,
        runbook: &RunbookRow,
        spec: &RunbookSpec,
    ) -> Result<()> {
        for batch in self.db.list_live_batches(&runbook.name).await? {
            if batch.status != "detected" || batch.is_manual {
                continue;
            }
            let version = self
                .db
                .max_phase_version(batch.id)
                .await?
                .unwrap_or(runbook.version);

            if spec.init.is_empty() {
                self.db
                    .set_batch_status(batch.id, &[BatchStatus::Detected], BatchStatus::Active)
                    .await?;
                continue;
            }

            if self.db.next_pending_init(batch.id, version).await?.is_some() {
                publish_event(
                    self.bus.as_ref(),
                    &EngineEvent::BatchInit {
                        runbook_name: runbook.name.clone(),
                        runbook_version: version,
                        batch_id: batch.id,
                    },
                )
                .await?;
                self.db
                    .set_batch_status(
                        batch.id,
                        &[BatchStatus::Detected],
                        BatchStatus::InitDispatched,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Publish `phase-due` for pending phases whose time has come, then
    /// transition each record to dispatched. Members are loaded once per
    /// batch across all of its due phases.
    async fn dispatch_due_phases(&self, runbook: &RunbookRow, now: DateTime<Utc>) -> Result<()> {
        for batch in self.db.list_live_batches(&runbook.name).await? {
            // Init gates phases; manual batches advance by operator command.
            if batch.status != "active" || batch.is_manual {
                continue;
            }

            let due = self.db.due_pending_phases(batch.id, now).await?;
            if due.is_empty() {
                continue;
            }

            let member_ids: Vec<i64> = self
                .db
                .list_active_members(batch.id)
                .await?
                .iter()
                .map(|m| m.id)
                .collect();

            for phase in due {
                publish_event(
                    self.bus.as_ref(),
                    &EngineEvent::PhaseDue {
                        runbook_name: runbook.name.clone(),
                        runbook_version: phase.runbook_version,
                        batch_id: batch.id,
                        phase_execution_id: phase.id,
                        phase_name: phase.phase_name.clone(),
                        offset_minutes: phase.offset_minutes,
                        due_at: phase.due_at,
                        member_ids: member_ids.clone(),
                    },
                )
                .await?;
                self.db
                    .set_phase_status(phase.id, &[PhaseStatus::Pending], PhaseStatus::Dispatched)
                    .await?;
                info!(batch_id = batch.id, phase = %phase.phase_name, "phase dispatched");
            }
        }
        Ok(())
    }

    /// Publish `poll-check` for every polling execution whose interval has
    /// elapsed.
    pub(crate) async fn sweep_polling(&self, now: DateTime<Utc>) -> Result<()> {
        for step in self.db.due_polling_steps(now).await? {
            publish_event(
                self.bus.as_ref(),
                &EngineEvent::PollCheck {
                    target: ExecutionRef::Step {
                        step_execution_id: step.id,
                    },
                },
            )
            .await?;
        }
        for init in self.db.due_polling_inits(now).await? {
            publish_event(
                self.bus.as_ref(),
                &EngineEvent::PollCheck {
                    target: ExecutionRef::Init {
                        init_execution_id: init.id,
                    },
                },
            )
            .await?;
        }
        Ok(())
    }
}

/// Init steps resolved for the version-transition path, where the batch
/// already exists.
fn resolved_inits(
    spec: &RunbookSpec,
    batch_id: i64,
    batch_start_time: DateTime<Utc>,
) -> Result<Vec<cutover_storage::models::NewExecutionStep>> {
    let ctx = cutover_core::TemplateContext::batch_scoped(batch_id, batch_start_time);
    let mut resolved = Vec::with_capacity(spec.init.len());
    for template in steps::init_templates(spec)? {
        let function_name = cutover_core::template::resolve(&template.function, &ctx)?;
        let params = cutover_core::template::resolve_map(&template.params, &ctx)?;
        resolved.push(cutover_storage::models::NewExecutionStep {
            step_index: template.step_index,
            step_name: template.step_name,
            worker_id: template.worker_id,
            function_name,
            parameters: serde_json::to_value(params)?,
            poll_interval_sec: template.poll_interval_sec,
            poll_timeout_sec: template.poll_timeout_sec,
            max_retries: template.max_retries,
            retry_interval_sec: template.retry_interval_sec,
            on_failure: template.on_failure,
            output_params: serde_json::Value::Object(Default::default()),
        });
    }
    Ok(resolved)
}

/// Quantize a timestamp down to a five-minute boundary.
pub(crate) fn quantize_batch_time(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    let floored = secs - secs.rem_euclid(300);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_batch_time() {
        let t: DateTime<Utc> = "2026-06-01T12:03:47Z".parse().unwrap();
        assert_eq!(
            quantize_batch_time(t),
            "2026-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );

        let t: DateTime<Utc> = "2026-06-01T12:05:00Z".parse().unwrap();
        assert_eq!(quantize_batch_time(t), t);

        // Quantization is to 5-minute boundaries, not midnight
        let t: DateTime<Utc> = "2026-06-01T23:59:59Z".parse().unwrap();
        assert_eq!(
            quantize_batch_time(t),
            "2026-06-01T23:55:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }
}
