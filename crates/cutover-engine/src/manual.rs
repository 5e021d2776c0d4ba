// Manual batch service
//
// The non-cron variant of the batch state machine: membership and phase
// advancement are driven by admin API calls instead of data-source polling.
// Advance is idempotent and refuses to outrun init steps or an in-flight
// phase; precondition failures surface as EngineError::Precondition so the
// API can answer 4xx.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cutover_bus::MessageBus;
use cutover_contracts::{BatchStatus, EngineEvent, PhaseStatus};
use cutover_core::{csvio, plan_new_batch, RunbookSpec};
use cutover_storage::models::{BatchRow, NewBatch, NewMember, NewPhaseExecution, RunbookRow};
use cutover_storage::Database;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::events::publish_event;
use crate::steps;

/// Result of creating a manual batch
#[derive(Debug)]
pub struct ManualBatchCreated {
    pub batch: BatchRow,
    pub member_count: usize,
    pub warnings: Vec<String>,
}

/// Outcome of an advance command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Init steps were kicked off
    InitDispatched,
    /// No init steps; the batch went straight to active
    Activated,
    /// The named phase was dispatched
    PhaseDispatched(String),
    /// Every phase is settled; the batch completed
    Completed,
    /// The batch was already completed
    AlreadyCompleted,
}

/// Admin-driven operations on manual batches
#[derive(Clone)]
pub struct ManualBatchService {
    db: Database,
    bus: Arc<dyn MessageBus>,
}

impl ManualBatchService {
    pub fn new(db: Database, bus: Arc<dyn MessageBus>) -> Self {
        Self { db, bus }
    }

    /// Parse and validate a member CSV against a runbook's required
    /// columns. Returns the row maps plus non-fatal warnings.
    pub fn ingest_csv(
        spec: &RunbookSpec,
        csv_text: &str,
    ) -> Result<(Vec<BTreeMap<String, String>>, Vec<String>)> {
        let document = csvio::parse(csv_text)?;
        let ingest = csvio::validate_members(
            &document,
            &spec.data_source.primary_key,
            &csvio::required_columns(spec),
        )?;
        Ok((ingest.rows, ingest.warnings))
    }

    /// The CSV upload template for a runbook's active version.
    pub async fn csv_template(&self, runbook_name: &str) -> Result<String> {
        let (_, spec) = self.active_runbook(runbook_name).await?;
        Ok(csvio::template(&spec)?)
    }

    /// Create a manual batch with an initial member list: the same
    /// single-transaction record set as auto detection, with `is_manual`
    /// set and no events published (advance drives the lifecycle).
    #[instrument(skip(self, rows, warnings))]
    pub async fn create_batch(
        &self,
        runbook_name: &str,
        batch_start_time: DateTime<Utc>,
        rows: Vec<BTreeMap<String, String>>,
        warnings: Vec<String>,
    ) -> Result<ManualBatchCreated> {
        let (runbook, spec) = self.active_runbook(runbook_name).await?;

        if self
            .db
            .find_batch(runbook_name, batch_start_time)
            .await?
            .is_some()
        {
            return Err(EngineError::precondition(format!(
                "batch for {runbook_name} at {batch_start_time} already exists"
            )));
        }
        if rows.is_empty() {
            return Err(EngineError::precondition("member list is empty"));
        }

        let primary_key = &spec.data_source.primary_key;
        let mut members = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(key) = row.get(primary_key).filter(|k| !k.is_empty()) else {
                return Err(EngineError::precondition(format!(
                    "member row without primary key {primary_key:?}"
                )));
            };
            members.push(NewMember {
                member_key: key.clone(),
                data_json: row_to_snapshot(row),
            });
        }

        let phases: Vec<NewPhaseExecution> = plan_new_batch(&spec, batch_start_time)?
            .into_iter()
            .map(|p| NewPhaseExecution {
                phase_name: p.name,
                runbook_version: runbook.version,
                offset_minutes: p.offset_minutes,
                due_at: p.due_at,
                status: "pending".to_string(),
            })
            .collect();

        let (batch, created) = self
            .db
            .create_batch(NewBatch {
                runbook_name: runbook_name.to_string(),
                runbook_version: runbook.version,
                batch_start_time,
                is_manual: true,
                members,
                phases,
                inits: steps::init_templates(&spec)?,
            })
            .await?;

        info!(batch_id = batch.id, members = created.len(), "manual batch created");
        Ok(ManualBatchCreated {
            batch,
            member_count: created.len(),
            warnings,
        })
    }

    /// Advance the batch's state machine one step. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn advance(&self, batch_id: i64) -> Result<AdvanceOutcome> {
        let batch = self.manual_batch(batch_id).await?;
        let status: BatchStatus = batch
            .status
            .parse()
            .map_err(|_| EngineError::precondition(format!("batch {batch_id} has unknown status")))?;

        match status {
            BatchStatus::Detected => self.advance_from_detected(&batch).await,
            BatchStatus::InitDispatched => {
                Err(EngineError::precondition("init steps not yet completed"))
            }
            BatchStatus::Active => self.advance_from_active(&batch).await,
            BatchStatus::Completed => Ok(AdvanceOutcome::AlreadyCompleted),
            BatchStatus::Failed => Err(EngineError::precondition("batch has failed")),
            BatchStatus::Cancelled => Err(EngineError::precondition("batch is cancelled")),
        }
    }

    async fn advance_from_detected(&self, batch: &BatchRow) -> Result<AdvanceOutcome> {
        let version = self.batch_version(batch).await?;

        if self
            .db
            .next_pending_init(batch.id, version)
            .await?
            .is_some()
        {
            publish_event(
                self.bus.as_ref(),
                &EngineEvent::BatchInit {
                    runbook_name: batch.runbook_name.clone(),
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
            Ok(AdvanceOutcome::InitDispatched)
        } else {
            self.db
                .set_batch_status(batch.id, &[BatchStatus::Detected], BatchStatus::Active)
                .await?;
            Ok(AdvanceOutcome::Activated)
        }
    }

    async fn advance_from_active(&self, batch: &BatchRow) -> Result<AdvanceOutcome> {
        let version = self.batch_version(batch).await?;
        let phases = self.db.list_phases_for_version(batch.id, version).await?;

        if let Some(in_flight) = phases
            .iter()
            .find(|p| p.status.parse::<PhaseStatus>() == Ok(PhaseStatus::Dispatched))
        {
            return Err(EngineError::precondition(format!(
                "phase {} still in progress",
                in_flight.phase_name
            )));
        }

        // Phases are listed in execution order; the first pending one is
        // next.
        if let Some(next) = phases
            .iter()
            .find(|p| p.status.parse::<PhaseStatus>() == Ok(PhaseStatus::Pending))
        {
            let member_ids: Vec<i64> = self
                .db
                .list_active_members(batch.id)
                .await?
                .iter()
                .map(|m| m.id)
                .collect();
            publish_event(
                self.bus.as_ref(),
                &EngineEvent::PhaseDue {
                    runbook_name: batch.runbook_name.clone(),
                    runbook_version: next.runbook_version,
                    batch_id: batch.id,
                    phase_execution_id: next.id,
                    phase_name: next.phase_name.clone(),
                    offset_minutes: next.offset_minutes,
                    due_at: next.due_at,
                    member_ids,
                },
            )
            .await?;
            self.db
                .set_phase_status(next.id, &[PhaseStatus::Pending], PhaseStatus::Dispatched)
                .await?;
            info!(batch_id = batch.id, phase = %next.phase_name, "manual phase dispatched");
            return Ok(AdvanceOutcome::PhaseDispatched(next.phase_name.clone()));
        }

        let all_settled = phases
            .iter()
            .all(|p| p.status.parse::<PhaseStatus>().map(|s| s.is_settled()).unwrap_or(false));
        if all_settled {
            self.db
                .set_batch_status(batch.id, &[BatchStatus::Active], BatchStatus::Completed)
                .await?;
            info!(batch_id = batch.id, "manual batch completed");
            Ok(AdvanceOutcome::Completed)
        } else {
            Err(EngineError::precondition(
                "no pending phases and the batch cannot settle",
            ))
        }
    }

    /// Cancel the batch and every open step execution.
    #[instrument(skip(self))]
    pub async fn cancel(&self, batch_id: i64) -> Result<()> {
        let batch = self.manual_batch(batch_id).await?;

        if batch.status == "cancelled" {
            return Ok(());
        }
        let moved = self
            .db
            .set_batch_status(
                batch.id,
                &[
                    BatchStatus::Detected,
                    BatchStatus::InitDispatched,
                    BatchStatus::Active,
                ],
                BatchStatus::Cancelled,
            )
            .await?;
        if !moved {
            return Err(EngineError::precondition(format!(
                "batch {batch_id} is terminal and cannot be cancelled"
            )));
        }

        let cancelled = self.db.cancel_open_batch_steps(batch_id).await?;
        info!(batch_id, cancelled, "manual batch cancelled");
        Ok(())
    }

    /// Add members to a live manual batch, publishing member-added with the
    /// stamp-on-success rule.
    #[instrument(skip(self, rows))]
    pub async fn add_members(
        &self,
        batch_id: i64,
        rows: Vec<BTreeMap<String, String>>,
    ) -> Result<usize> {
        let batch = self.live_manual_batch(batch_id).await?;
        let version = self.batch_version(&batch).await?;
        let spec = self.spec_for(&batch.runbook_name, version).await?;
        let primary_key = &spec.data_source.primary_key;

        let mut added = 0;
        for row in rows {
            let Some(key) = row.get(primary_key).filter(|k| !k.is_empty()) else {
                return Err(EngineError::precondition("member row without primary key"));
            };
            let member = self
                .db
                .upsert_member(
                    batch_id,
                    &NewMember {
                        member_key: key.clone(),
                        data_json: row_to_snapshot(&row),
                    },
                )
                .await?;
            added += 1;

            let event = EngineEvent::MemberAdded {
                runbook_name: batch.runbook_name.clone(),
                batch_id,
                member_id: member.id,
            };
            match publish_event(self.bus.as_ref(), &event).await {
                Ok(()) => self.db.stamp_add_dispatched(member.id).await?,
                Err(e) => warn!(member_id = member.id, "member-added publish failed: {e}"),
            }
        }
        Ok(added)
    }

    /// Remove members by key, publishing member-removed with the
    /// stamp-on-success rule. Unknown keys are ignored.
    #[instrument(skip(self, member_keys))]
    pub async fn remove_members(&self, batch_id: i64, member_keys: &[String]) -> Result<usize> {
        let batch = self.live_manual_batch(batch_id).await?;

        let mut removed = 0;
        for key in member_keys {
            let Some(member) = self.db.get_member_by_key(batch_id, key).await? else {
                continue;
            };
            if !self.db.mark_member_removed(member.id).await? {
                continue;
            }
            removed += 1;

            let event = EngineEvent::MemberRemoved {
                runbook_name: batch.runbook_name.clone(),
                batch_id,
                member_id: member.id,
            };
            match publish_event(self.bus.as_ref(), &event).await {
                Ok(()) => self.db.stamp_remove_dispatched(member.id).await?,
                Err(e) => warn!(member_id = member.id, "member-removed publish failed: {e}"),
            }
        }
        Ok(removed)
    }

    // ============================================
    // Lookups
    // ============================================

    async fn active_runbook(&self, name: &str) -> Result<(RunbookRow, RunbookSpec)> {
        let row = self
            .db
            .get_active_runbook(name)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("runbook {name}")))?;
        let spec = serde_json::from_value(row.spec.clone())?;
        Ok((row, spec))
    }

    async fn spec_for(&self, name: &str, version: i32) -> Result<RunbookSpec> {
        let row = self
            .db
            .get_runbook_version(name, version)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("runbook {name} v{version}")))?;
        Ok(serde_json::from_value(row.spec)?)
    }

    async fn manual_batch(&self, batch_id: i64) -> Result<BatchRow> {
        let batch = self
            .db
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("batch {batch_id}")))?;
        if !batch.is_manual {
            return Err(EngineError::precondition(format!(
                "batch {batch_id} is not manual"
            )));
        }
        Ok(batch)
    }

    async fn live_manual_batch(&self, batch_id: i64) -> Result<BatchRow> {
        let batch = self.manual_batch(batch_id).await?;
        let live = batch
            .status
            .parse::<BatchStatus>()
            .map(|s| s.is_live())
            .unwrap_or(false);
        if !live {
            return Err(EngineError::precondition(format!(
                "batch {batch_id} is not live"
            )));
        }
        Ok(batch)
    }

    /// The version the batch's records run at, falling back to the active
    /// runbook version.
    async fn batch_version(&self, batch: &BatchRow) -> Result<i32> {
        if let Some(version) = self.db.max_phase_version(batch.id).await? {
            return Ok(version);
        }
        let (runbook, _) = self.active_runbook(&batch.runbook_name).await?;
        Ok(runbook.version)
    }
}

fn row_to_snapshot(row: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}
