// Repository layer for database operations
//
// One Database handle serves runbooks, batches, members, and phase
// executions; step and init executions live in executions.rs, the dynamic
// per-runbook tables in dynamic_table.rs, and the scheduler lease in
// lease.rs. Status transitions are compare-and-set: callers get `true` when
// this invocation performed the transition and `false` when a concurrent
// handler already had.

use chrono::{DateTime, Utc};
use cutover_contracts::{BatchStatus, PhaseStatus};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::models::*;

const BATCH_COLUMNS: &str =
    "id, runbook_name, batch_start_time, status, is_manual, created_at, updated_at";

const MEMBER_COLUMNS: &str = "id, batch_id, member_key, status, data_json, worker_data_json, \
     add_dispatched_at, remove_dispatched_at, created_at, updated_at";

const PHASE_COLUMNS: &str = "id, batch_id, phase_name, runbook_version, offset_minutes, due_at, \
     status, created_at, updated_at";

const RUNBOOK_COLUMNS: &str = "id, name, version, spec, is_active, automation_enabled, \
     overdue_behavior, ignore_overdue_applied, rerun_init, data_table, created_at";

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ============================================
    // Runbooks
    // ============================================

    /// Publish a new version of a runbook: the next version number for the
    /// name, active, superseding any previously active version.
    #[instrument(skip(self, input), fields(runbook = %input.name))]
    pub async fn publish_runbook(&self, input: PublishRunbook) -> Result<RunbookRow> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) + 1 AS next FROM runbooks WHERE name = $1")
            .bind(&input.name)
            .fetch_one(&mut *tx)
            .await?;
        let version: i32 = row.get("next");

        sqlx::query("UPDATE runbooks SET is_active = FALSE WHERE name = $1 AND is_active")
            .bind(&input.name)
            .execute(&mut *tx)
            .await?;

        let data_table = cutover_core::dynamic_table_name(&input.name, version);
        let row = sqlx::query_as::<_, RunbookRow>(&format!(
            r#"
            INSERT INTO runbooks
                (name, version, spec, is_active, overdue_behavior, rerun_init, data_table)
            VALUES ($1, $2, $3, TRUE, $4, $5, $6)
            RETURNING {RUNBOOK_COLUMNS}
            "#,
        ))
        .bind(&input.name)
        .bind(version)
        .bind(&input.spec)
        .bind(&input.overdue_behavior)
        .bind(input.rerun_init)
        .bind(&data_table)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(version, "published runbook");
        Ok(row)
    }

    pub async fn get_active_runbook(&self, name: &str) -> Result<Option<RunbookRow>> {
        let row = sqlx::query_as::<_, RunbookRow>(&format!(
            "SELECT {RUNBOOK_COLUMNS} FROM runbooks WHERE name = $1 AND is_active"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_runbook_version(&self, name: &str, version: i32) -> Result<Option<RunbookRow>> {
        let row = sqlx::query_as::<_, RunbookRow>(&format!(
            "SELECT {RUNBOOK_COLUMNS} FROM runbooks WHERE name = $1 AND version = $2"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_runbook_versions(&self, name: &str) -> Result<Vec<RunbookRow>> {
        let rows = sqlx::query_as::<_, RunbookRow>(&format!(
            "SELECT {RUNBOOK_COLUMNS} FROM runbooks WHERE name = $1 ORDER BY version DESC"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// All active runbook versions, one per name.
    pub async fn list_active_runbooks(&self) -> Result<Vec<RunbookRow>> {
        let rows = sqlx::query_as::<_, RunbookRow>(&format!(
            "SELECT {RUNBOOK_COLUMNS} FROM runbooks WHERE is_active ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Toggle scheduler automation for a runbook (applies to the active
    /// version).
    pub async fn set_automation_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE runbooks SET automation_enabled = $2 WHERE name = $1 AND is_active")
                .bind(name)
                .bind(enabled)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// One-shot marker for the ignore-overdue policy.
    pub async fn mark_ignore_overdue_applied(&self, name: &str, version: i32) -> Result<()> {
        sqlx::query(
            "UPDATE runbooks SET ignore_overdue_applied = TRUE WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Batches
    // ============================================

    /// Create a batch with its members, phase executions, and init
    /// executions in one transaction. The batch starts in `detected`; the
    /// caller advances it after publishing the appropriate event.
    #[instrument(skip(self, input), fields(runbook = %input.runbook_name))]
    pub async fn create_batch(&self, input: NewBatch) -> Result<(BatchRow, Vec<BatchMemberRow>)> {
        let mut tx = self.pool.begin().await?;

        let batch = sqlx::query_as::<_, BatchRow>(&format!(
            r#"
            INSERT INTO batches (runbook_name, batch_start_time, status, is_manual)
            VALUES ($1, $2, 'detected', $3)
            RETURNING {BATCH_COLUMNS}
            "#,
        ))
        .bind(&input.runbook_name)
        .bind(input.batch_start_time)
        .bind(input.is_manual)
        .fetch_one(&mut *tx)
        .await?;

        let mut members = Vec::with_capacity(input.members.len());
        for member in &input.members {
            let row = sqlx::query_as::<_, BatchMemberRow>(&format!(
                r#"
                INSERT INTO batch_members (batch_id, member_key, data_json)
                VALUES ($1, $2, $3)
                RETURNING {MEMBER_COLUMNS}
                "#,
            ))
            .bind(batch.id)
            .bind(&member.member_key)
            .bind(&member.data_json)
            .fetch_one(&mut *tx)
            .await?;
            members.push(row);
        }

        insert_phases_tx(&mut tx, batch.id, &input.phases).await?;

        // Init steps are batch-scoped: reserved placeholders resolve now that
        // the batch id exists.
        let ctx = cutover_core::TemplateContext::batch_scoped(batch.id, batch.batch_start_time);
        for init in &input.inits {
            let function_name = cutover_core::template::resolve(&init.function, &ctx)?;
            let params = cutover_core::template::resolve_map(&init.params, &ctx)?;
            let step = NewExecutionStep {
                step_index: init.step_index,
                step_name: init.step_name.clone(),
                worker_id: init.worker_id.clone(),
                function_name,
                parameters: serde_json::to_value(params)?,
                poll_interval_sec: init.poll_interval_sec,
                poll_timeout_sec: init.poll_timeout_sec,
                max_retries: init.max_retries,
                retry_interval_sec: init.retry_interval_sec,
                on_failure: init.on_failure.clone(),
                output_params: serde_json::Value::Object(Default::default()),
            };
            insert_init_tx(&mut tx, batch.id, input.runbook_version, &step).await?;
        }

        tx.commit().await?;
        debug!(batch_id = batch.id, members = members.len(), "created batch");
        Ok((batch, members))
    }

    pub async fn get_batch(&self, id: i64) -> Result<Option<BatchRow>> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn find_batch(
        &self,
        runbook_name: &str,
        batch_start_time: DateTime<Utc>,
    ) -> Result<Option<BatchRow>> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE runbook_name = $1 AND batch_start_time = $2"
        ))
        .bind(runbook_name)
        .bind(batch_start_time)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_batches(&self, runbook_name: Option<&str>) -> Result<Vec<BatchRow>> {
        let rows = match runbook_name {
            Some(name) => {
                sqlx::query_as::<_, BatchRow>(&format!(
                    "SELECT {BATCH_COLUMNS} FROM batches WHERE runbook_name = $1 ORDER BY batch_start_time DESC"
                ))
                .bind(name)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, BatchRow>(&format!(
                    "SELECT {BATCH_COLUMNS} FROM batches ORDER BY batch_start_time DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    /// Batches the scheduler still drives: not completed, failed, or
    /// cancelled.
    pub async fn list_live_batches(&self, runbook_name: &str) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            r#"
            SELECT {BATCH_COLUMNS} FROM batches
            WHERE runbook_name = $1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            ORDER BY batch_start_time
            "#,
        ))
        .bind(runbook_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Compare-and-set batch status transition. Returns false when no row was
    /// in any of the expected states.
    pub async fn set_batch_status(
        &self,
        id: i64,
        expected: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool> {
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(&expected)
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Batch members
    // ============================================

    pub async fn list_members(&self, batch_id: i64) -> Result<Vec<BatchMemberRow>> {
        let rows = sqlx::query_as::<_, BatchMemberRow>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM batch_members WHERE batch_id = $1 ORDER BY id"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn list_active_members(&self, batch_id: i64) -> Result<Vec<BatchMemberRow>> {
        let rows = sqlx::query_as::<_, BatchMemberRow>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM batch_members WHERE batch_id = $1 AND status = 'active' ORDER BY id"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_member_by_key(
        &self,
        batch_id: i64,
        member_key: &str,
    ) -> Result<Option<BatchMemberRow>> {
        let row = sqlx::query_as::<_, BatchMemberRow>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM batch_members WHERE batch_id = $1 AND member_key = $2"
        ))
        .bind(batch_id)
        .bind(member_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_member(&self, id: i64) -> Result<Option<BatchMemberRow>> {
        let row = sqlx::query_as::<_, BatchMemberRow>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM batch_members WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Insert a member, or re-activate a previously removed row for the same
    /// key. A re-activated member gets fresh dispatch stamps so its
    /// member-added event is published again.
    pub async fn upsert_member(&self, batch_id: i64, member: &NewMember) -> Result<BatchMemberRow> {
        let row = sqlx::query_as::<_, BatchMemberRow>(&format!(
            r#"
            INSERT INTO batch_members (batch_id, member_key, data_json)
            VALUES ($1, $2, $3)
            ON CONFLICT (batch_id, member_key) DO UPDATE
            SET status = 'active',
                data_json = EXCLUDED.data_json,
                add_dispatched_at = NULL,
                remove_dispatched_at = NULL,
                updated_at = NOW()
            RETURNING {MEMBER_COLUMNS}
            "#,
        ))
        .bind(batch_id)
        .bind(&member.member_key)
        .bind(&member.data_json)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Refresh the data snapshot of a still-present member.
    pub async fn refresh_member_snapshot(
        &self,
        member_id: i64,
        data_json: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batch_members SET data_json = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(member_id)
        .bind(data_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a member removed. The remove stamp is cleared so the removal
    /// event is published (and re-published until stamped).
    pub async fn mark_member_removed(&self, member_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_members
            SET status = 'removed', remove_dispatched_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that the member-added event reached the bus.
    pub async fn stamp_add_dispatched(&self, member_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE batch_members SET add_dispatched_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record that the member-removed event reached the bus.
    pub async fn stamp_remove_dispatched(&self, member_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE batch_members SET remove_dispatched_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Merge step output values into the member's worker data. Existing keys
    /// are overwritten, everything else is preserved.
    pub async fn merge_worker_data(
        &self,
        member_id: i64,
        patch: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batch_members
            SET worker_data_json = worker_data_json || $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(member_id)
        .bind(patch)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Member keys active in other live batches of the same runbook. Used by
    /// immediate-mode synchronization to avoid enrolling an entity twice.
    pub async fn active_member_keys_elsewhere(
        &self,
        runbook_name: &str,
        exclude_batch_id: i64,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT m.member_key
            FROM batch_members m
            JOIN batches b ON b.id = m.batch_id
            WHERE b.runbook_name = $1
              AND b.id <> $2
              AND b.status NOT IN ('completed', 'failed', 'cancelled')
              AND m.status = 'active'
            "#,
        )
        .bind(runbook_name)
        .bind(exclude_batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("member_key")).collect())
    }

    // ============================================
    // Phase executions
    // ============================================

    /// Insert phase records for a batch (version transitions). Records that
    /// already exist for (batch, phase, version) are left untouched.
    pub async fn insert_phase_executions(
        &self,
        batch_id: i64,
        phases: &[NewPhaseExecution],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_phases_tx(&mut tx, batch_id, phases).await?;
        tx.commit().await?;
        Ok(())
    }

    /// All phase records of a batch in execution order: earliest due first,
    /// insertion order breaking ties.
    pub async fn list_phases(&self, batch_id: i64) -> Result<Vec<PhaseExecutionRow>> {
        let rows = sqlx::query_as::<_, PhaseExecutionRow>(&format!(
            "SELECT {PHASE_COLUMNS} FROM phase_executions WHERE batch_id = $1 ORDER BY due_at, id"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn list_phases_for_version(
        &self,
        batch_id: i64,
        runbook_version: i32,
    ) -> Result<Vec<PhaseExecutionRow>> {
        let rows = sqlx::query_as::<_, PhaseExecutionRow>(&format!(
            r#"
            SELECT {PHASE_COLUMNS} FROM phase_executions
            WHERE batch_id = $1 AND runbook_version = $2
            ORDER BY due_at, id
            "#,
        ))
        .bind(batch_id)
        .bind(runbook_version)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_phase(&self, id: i64) -> Result<Option<PhaseExecutionRow>> {
        let row = sqlx::query_as::<_, PhaseExecutionRow>(&format!(
            "SELECT {PHASE_COLUMNS} FROM phase_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Pending phases whose due time has arrived, in execution order.
    pub async fn due_pending_phases(
        &self,
        batch_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<PhaseExecutionRow>> {
        let rows = sqlx::query_as::<_, PhaseExecutionRow>(&format!(
            r#"
            SELECT {PHASE_COLUMNS} FROM phase_executions
            WHERE batch_id = $1 AND status = 'pending' AND due_at <= $2
            ORDER BY due_at, id
            "#,
        ))
        .bind(batch_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Compare-and-set phase status transition.
    pub async fn set_phase_status(
        &self,
        id: i64,
        expected: &[PhaseStatus],
        to: PhaseStatus,
    ) -> Result<bool> {
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE phase_executions
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(&expected)
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Supersede still-pending phase records of an older runbook version.
    pub async fn supersede_pending_phases(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE phase_executions
            SET status = 'superseded', updated_at = NOW()
            WHERE id = ANY($1) AND status = 'pending'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Highest runbook version any phase of the batch was recorded at.
    pub async fn max_phase_version(&self, batch_id: i64) -> Result<Option<i32>> {
        let row = sqlx::query(
            "SELECT MAX(runbook_version) AS v FROM phase_executions WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("v"))
    }
}

pub(crate) async fn insert_phases_tx(
    tx: &mut Transaction<'_, Postgres>,
    batch_id: i64,
    phases: &[NewPhaseExecution],
) -> Result<()> {
    for phase in phases {
        sqlx::query(
            r#"
            INSERT INTO phase_executions
                (batch_id, phase_name, runbook_version, offset_minutes, due_at, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (batch_id, phase_name, runbook_version) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(&phase.phase_name)
        .bind(phase.runbook_version)
        .bind(phase.offset_minutes)
        .bind(phase.due_at)
        .bind(&phase.status)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub(crate) async fn insert_init_tx(
    tx: &mut Transaction<'_, Postgres>,
    batch_id: i64,
    runbook_version: i32,
    init: &NewExecutionStep,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO init_executions
            (batch_id, runbook_version, step_index, step_name, worker_id, function_name,
             parameters, poll_interval_sec, poll_timeout_sec, max_retries,
             retry_interval_sec, on_failure)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (batch_id, runbook_version, step_index) DO NOTHING
        "#,
    )
    .bind(batch_id)
    .bind(runbook_version)
    .bind(init.step_index)
    .bind(&init.step_name)
    .bind(&init.worker_id)
    .bind(&init.function_name)
    .bind(&init.parameters)
    .bind(init.poll_interval_sec)
    .bind(init.poll_timeout_sec)
    .bind(init.max_retries)
    .bind(init.retry_interval_sec)
    .bind(&init.on_failure)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
