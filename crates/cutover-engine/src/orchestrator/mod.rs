// Orchestrator
//
// Event-driven handler set consuming internal scheduling events and worker
// results from the bus. Every handler is idempotent under duplicate
// delivery: terminal rows are ignored and each transition is a
// compare-and-set, so redelivered messages find zero rows to advance and
// return without side effects.

mod checks;
mod members;
mod phase_due;
mod results;

use std::sync::Arc;
use std::time::Duration;

use cutover_bus::{ClaimedMessage, MessageBus};
use cutover_contracts::{
    BatchStatus, EngineEvent, PhaseStatus, StepStatus, WorkerResult, EVENTS_SUBJECT,
    RESULTS_SUBJECT,
};
use cutover_core::RunbookSpec;
use cutover_storage::models::{BatchMemberRow, BatchRow, PhaseExecutionRow};
use cutover_storage::Database;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::WorkerDispatcher;
use crate::error::{EngineError, Result};
use crate::steps;

/// Batch statuses a handler may still advance
const LIVE_STATUSES: [BatchStatus; 3] = [
    BatchStatus::Detected,
    BatchStatus::InitDispatched,
    BatchStatus::Active,
];

/// Consumer configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Consumer identity for bus claims
    pub consumer_id: String,
    /// Messages claimed per poll
    pub batch_size: usize,
    /// Poll interval when idle
    pub idle_interval: Duration,
    /// Claimed-but-unacknowledged recovery threshold
    pub stale_claim_threshold: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            consumer_id: format!("orchestrator-{}", uuid::Uuid::now_v7().simple()),
            batch_size: 10,
            idle_interval: Duration::from_secs(2),
            stale_claim_threshold: Duration::from_secs(300),
        }
    }
}

/// The orchestrator: one consumer over the events and results subjects
pub struct Orchestrator {
    pub(crate) db: Database,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) dispatcher: WorkerDispatcher,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(db: Database, bus: Arc<dyn MessageBus>, config: OrchestratorConfig) -> Self {
        let dispatcher = WorkerDispatcher::new(bus.clone());
        Self {
            db,
            bus,
            dispatcher,
            config,
        }
    }

    /// Consume messages until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(consumer = %self.config.consumer_id, "orchestrator started");
        let subjects = vec![EVENTS_SUBJECT.to_string(), RESULTS_SUBJECT.to_string()];

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let claimed = match self
                .bus
                .claim(&self.config.consumer_id, &subjects, self.config.batch_size)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!("failed to claim messages: {e}");
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                if let Err(e) = self.bus.reclaim_stale(self.config.stale_claim_threshold).await {
                    warn!("failed to reclaim stale messages: {e}");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }

            for message in claimed {
                self.process(message).await;
            }
        }

        info!(consumer = %self.config.consumer_id, "orchestrator stopped");
    }

    /// Handle one claimed message and acknowledge it. Handler errors fail
    /// the message so the bus redelivers and eventually dead-letters it.
    pub async fn process(&self, message: ClaimedMessage) {
        let outcome = self.handle(&message).await;
        let ack = match outcome {
            Ok(()) => self.bus.complete(message.id).await,
            Err(e) => {
                warn!(kind = %message.kind, "handler failed: {e}");
                self.bus.fail(message.id, &e.to_string()).await.map(|_| ())
            }
        };
        if let Err(e) = ack {
            error!(message_id = %message.id, "failed to acknowledge message: {e}");
        }
    }

    async fn handle(&self, message: &ClaimedMessage) -> Result<()> {
        match message.subject.as_str() {
            EVENTS_SUBJECT => {
                let event: EngineEvent = message.payload()?;
                self.handle_event(&event).await
            }
            RESULTS_SUBJECT => {
                let result: WorkerResult = message.payload()?;
                self.handle_worker_result(&result).await
            }
            other => {
                warn!(subject = other, "message on unexpected subject dropped");
                Ok(())
            }
        }
    }

    /// Dispatch one internal event to its handler.
    #[instrument(skip(self, event), fields(kind = event.kind()))]
    pub async fn handle_event(&self, event: &EngineEvent) -> Result<()> {
        match event {
            EngineEvent::BatchInit {
                runbook_name,
                runbook_version,
                batch_id,
            } => {
                self.handle_batch_init(runbook_name, *runbook_version, *batch_id)
                    .await
            }
            EngineEvent::PhaseDue {
                runbook_name,
                runbook_version,
                batch_id,
                phase_execution_id,
                ..
            } => {
                self.handle_phase_due(runbook_name, *runbook_version, *batch_id, *phase_execution_id)
                    .await
            }
            EngineEvent::MemberAdded {
                batch_id, member_id, ..
            } => self.handle_member_added(*batch_id, *member_id).await,
            EngineEvent::MemberRemoved {
                batch_id, member_id, ..
            } => self.handle_member_removed(*batch_id, *member_id).await,
            EngineEvent::PollCheck { target } => self.handle_poll_check(*target).await,
            EngineEvent::RetryCheck { target } => self.handle_retry_check(*target).await,
        }
    }

    // ============================================
    // batch-init
    // ============================================

    /// Dispatch the lowest-index pending init step of the batch.
    async fn handle_batch_init(
        &self,
        runbook_name: &str,
        runbook_version: i32,
        batch_id: i64,
    ) -> Result<()> {
        let Some(batch) = self.db.get_batch(batch_id).await? else {
            debug!(batch_id, "batch-init for unknown batch dropped");
            return Ok(());
        };
        if !batch_is_live(&batch) {
            return Ok(());
        }

        self.dispatch_next_init(runbook_name, runbook_version, batch_id)
            .await?;
        Ok(())
    }

    /// Dispatch the next pending init, if any. Returns true when a job went
    /// out.
    pub(crate) async fn dispatch_next_init(
        &self,
        runbook_name: &str,
        runbook_version: i32,
        batch_id: i64,
    ) -> Result<bool> {
        let Some(init) = self.db.next_pending_init(batch_id, runbook_version).await? else {
            return Ok(false);
        };

        let job = steps::job_for_init(&init, runbook_name);
        if self.db.mark_init_dispatched(init.id, job.job_id).await? {
            self.dispatcher.dispatch(job).await?;
            debug!(batch_id, init_id = init.id, "dispatched init step");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ============================================
    // Shared helpers
    // ============================================

    /// Load and parse the stored specification of a runbook version.
    pub(crate) async fn load_spec(&self, name: &str, version: i32) -> Result<RunbookSpec> {
        let row = self
            .db
            .get_runbook_version(name, version)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("runbook {name} v{version}")))?;
        Ok(serde_json::from_value(row.spec)?)
    }

    /// The runbook version the batch currently runs at: the highest version
    /// any of its phase records carries.
    pub(crate) async fn current_batch_version(&self, batch_id: i64) -> Result<Option<i32>> {
        Ok(self.db.max_phase_version(batch_id).await?)
    }

    /// Re-evaluate batch completion from its current-version phase records:
    /// any failed phase fails the batch; all settled completes it.
    pub(crate) async fn evaluate_batch_completion(&self, batch: &BatchRow) -> Result<()> {
        let Some(version) = self.current_batch_version(batch.id).await? else {
            return Ok(());
        };
        let phases = self.db.list_phases_for_version(batch.id, version).await?;
        if phases.is_empty() {
            return Ok(());
        }

        let statuses: Vec<PhaseStatus> = phases
            .iter()
            .filter_map(|p| p.status.parse().ok())
            .collect();

        if statuses.iter().any(|s| *s == PhaseStatus::Failed) {
            if self
                .db
                .set_batch_status(batch.id, &LIVE_STATUSES, BatchStatus::Failed)
                .await?
            {
                info!(batch_id = batch.id, "batch failed");
            }
        } else if statuses.len() == phases.len() && statuses.iter().all(|s| s.is_settled()) {
            if self
                .db
                .set_batch_status(batch.id, &LIVE_STATUSES, BatchStatus::Completed)
                .await?
            {
                info!(batch_id = batch.id, "batch completed");
            }
        }
        Ok(())
    }

    /// Settle a dispatched phase once no step rows remain open. The phase
    /// completes when at least one member (or an empty phase) made it
    /// through every index; it fails when every enrolled member failed.
    pub(crate) async fn evaluate_phase_progress(
        &self,
        phase: &PhaseExecutionRow,
        batch: &BatchRow,
    ) -> Result<()> {
        let rows = self.db.list_steps_for_phase(phase.id).await?;

        let open = rows.iter().any(|r| {
            matches!(
                r.status.parse::<StepStatus>(),
                Ok(StepStatus::Pending | StepStatus::Dispatched | StepStatus::Polling)
            )
        });
        if open {
            return Ok(());
        }

        let mut member_ids: Vec<i64> = rows.iter().map(|r| r.member_id).collect();
        member_ids.sort_unstable();
        member_ids.dedup();

        let any_member_succeeded = member_ids.iter().any(|member_id| {
            rows.iter()
                .filter(|r| r.member_id == *member_id)
                .all(|r| r.status.parse::<StepStatus>() == Ok(StepStatus::Succeeded))
        });

        let target = if member_ids.is_empty() || any_member_succeeded {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };

        if self
            .db
            .set_phase_status(phase.id, &[PhaseStatus::Dispatched], target)
            .await?
        {
            info!(phase_id = phase.id, phase = %phase.phase_name, status = %target, "phase settled");
            self.evaluate_batch_completion(batch).await?;
        }
        Ok(())
    }

    /// Fire-and-forget rollback dispatch: resolve the referenced step list
    /// and publish one job per step. Resolution is best-effort; rollback
    /// never feeds back into phase progression.
    pub(crate) async fn trigger_rollback(
        &self,
        spec: &RunbookSpec,
        runbook_version: i32,
        batch: &BatchRow,
        reference: &str,
        member: Option<&BatchMemberRow>,
    ) -> Result<()> {
        let Some(rollback_steps) = spec.rollback_steps(reference) else {
            warn!(reference, "rollback reference not found in runbook");
            return Ok(());
        };

        let member_map = member.map(steps::resolution_map);
        for step in rollback_steps {
            let resolved = match &member_map {
                Some(map) => steps::resolve_member_step(spec, step, 0, batch, map),
                None => {
                    let empty = serde_json::Map::new();
                    steps::resolve_member_step(spec, step, 0, batch, &empty)
                }
            };
            let resolved = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(step = %step.name, "skipping rollback step: {e}");
                    continue;
                }
            };

            let job = crate::dispatch::JobRequest::new(
                batch.id,
                resolved.worker_id,
                resolved.function_name,
                serde_json::from_value(resolved.parameters).unwrap_or_default(),
                cutover_contracts::CorrelationData::untracked(&spec.name, runbook_version),
            );
            self.dispatcher.dispatch(job).await?;
        }

        info!(batch_id = batch.id, reference, "rollback dispatched");
        Ok(())
    }
}

/// Whether handlers may still advance this batch.
pub(crate) fn batch_is_live(batch: &BatchRow) -> bool {
    batch
        .status
        .parse::<BatchStatus>()
        .map(|s| s.is_live())
        .unwrap_or(false)
}
