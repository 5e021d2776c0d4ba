// Step and init execution repositories
//
// Both execution kinds share one status machine
// (pending → dispatched → (polling →)* terminal) and the same compare-and-set
// discipline. Steps are per (phase, member); inits are batch-scoped and run
// sequentially by index.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;
use crate::repositories::{insert_init_tx, Database};

const STEP_COLUMNS: &str = "id, phase_execution_id, batch_id, member_id, step_index, step_name, \
     worker_id, function_name, parameters, status, poll_interval_sec, poll_timeout_sec, \
     poll_started_at, last_polled_at, poll_count, retry_count, max_retries, retry_interval_sec, \
     on_failure, output_params, last_job_id, result, error_message, created_at, updated_at";

const INIT_COLUMNS: &str = "id, batch_id, runbook_version, step_index, step_name, worker_id, \
     function_name, parameters, status, poll_interval_sec, poll_timeout_sec, poll_started_at, \
     last_polled_at, poll_count, retry_count, max_retries, retry_interval_sec, on_failure, \
     last_job_id, result, error_message, created_at, updated_at";

impl Database {
    // ============================================
    // Step executions
    // ============================================

    /// Insert step executions in one transaction. Rows that already exist for
    /// (phase, member, index) are skipped, which makes duplicate `phase-due`
    /// deliveries produce the same set exactly once.
    #[instrument(skip(self, steps))]
    pub async fn insert_step_executions(&self, steps: &[NewStepExecution]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for step in steps {
            let result = sqlx::query(
                r#"
                INSERT INTO step_executions
                    (phase_execution_id, batch_id, member_id, step_index, step_name, worker_id,
                     function_name, parameters, poll_interval_sec, poll_timeout_sec, max_retries,
                     retry_interval_sec, on_failure, output_params)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (phase_execution_id, member_id, step_index) DO NOTHING
                "#,
            )
            .bind(step.phase_execution_id)
            .bind(step.batch_id)
            .bind(step.member_id)
            .bind(step.step.step_index)
            .bind(&step.step.step_name)
            .bind(&step.step.worker_id)
            .bind(&step.step.function_name)
            .bind(&step.step.parameters)
            .bind(step.step.poll_interval_sec)
            .bind(step.step.poll_timeout_sec)
            .bind(step.step.max_retries)
            .bind(step.step.retry_interval_sec)
            .bind(&step.step.on_failure)
            .bind(&step.step.output_params)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        debug!(inserted, "inserted step executions");
        Ok(inserted)
    }

    pub async fn get_step(&self, id: i64) -> Result<Option<StepExecutionRow>> {
        let row = sqlx::query_as::<_, StepExecutionRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// All step executions of a phase in dispatch order.
    pub async fn list_steps_for_phase(
        &self,
        phase_execution_id: i64,
    ) -> Result<Vec<StepExecutionRow>> {
        let rows = sqlx::query_as::<_, StepExecutionRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS} FROM step_executions
            WHERE phase_execution_id = $1
            ORDER BY step_index, id
            "#,
        ))
        .bind(phase_execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Member ids that already have step executions under a phase.
    pub async fn member_ids_with_steps(&self, phase_execution_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT member_id FROM step_executions WHERE phase_execution_id = $1",
        )
        .bind(phase_execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("member_id")).collect())
    }

    /// pending → dispatched, stamping the outgoing job id.
    pub async fn mark_step_dispatched(&self, id: i64, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'dispatched', last_job_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// dispatched|polling → polling. Stamps the poll bookkeeping; the first
    /// occurrence records `poll_started_at`.
    pub async fn mark_step_polling(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'polling',
                poll_started_at = COALESCE(poll_started_at, NOW()),
                last_polled_at = NOW(),
                poll_count = poll_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// dispatched|polling → succeeded with the terminal result payload.
    pub async fn mark_step_succeeded(
        &self,
        id: i64,
        result_json: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'succeeded', result = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(result_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// dispatched|polling → failed.
    pub async fn mark_step_failed(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// polling → poll_timeout.
    pub async fn mark_step_poll_timeout(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'poll_timeout',
                error_message = 'poll timeout exceeded',
                updated_at = NOW()
            WHERE id = $1 AND status = 'polling'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// dispatched|polling → pending, recording the failure that triggered the
    /// retry. The retry counter is incremented at redispatch time.
    pub async fn reset_step_for_retry(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'pending', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Retry redispatch: pending → dispatched while there is retry budget,
    /// consuming one retry.
    pub async fn redispatch_step_retry(&self, id: i64, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'dispatched',
                retry_count = retry_count + 1,
                last_job_id = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND retry_count < max_retries
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel a member's still-pending steps within one phase (the member
    /// failed the phase).
    pub async fn cancel_pending_member_steps(
        &self,
        phase_execution_id: i64,
        member_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'cancelled', updated_at = NOW()
            WHERE phase_execution_id = $1 AND member_id = $2 AND status = 'pending'
            "#,
        )
        .bind(phase_execution_id)
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancel every open step of a member across the batch (member removed).
    pub async fn cancel_open_member_steps(&self, batch_id: i64, member_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'cancelled', updated_at = NOW()
            WHERE batch_id = $1 AND member_id = $2
              AND status IN ('pending', 'dispatched', 'polling')
            "#,
        )
        .bind(batch_id)
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancel every open step of a batch (batch cancelled).
    pub async fn cancel_open_batch_steps(&self, batch_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = 'cancelled', updated_at = NOW()
            WHERE batch_id = $1 AND status IN ('pending', 'dispatched', 'polling')
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Polling steps whose poll interval has elapsed.
    pub async fn due_polling_steps(&self, now: DateTime<Utc>) -> Result<Vec<StepExecutionRow>> {
        let rows = sqlx::query_as::<_, StepExecutionRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS} FROM step_executions
            WHERE status = 'polling'
              AND last_polled_at + make_interval(secs => COALESCE(poll_interval_sec, 0)::float8) <= $1
            ORDER BY last_polled_at
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Init executions
    // ============================================

    /// Insert init executions for a batch at a runbook version. Existing
    /// (batch, version, index) rows are skipped.
    pub async fn insert_init_executions(
        &self,
        batch_id: i64,
        runbook_version: i32,
        inits: &[NewExecutionStep],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for init in inits {
            insert_init_tx(&mut tx, batch_id, runbook_version, init).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_init(&self, id: i64) -> Result<Option<InitExecutionRow>> {
        let row = sqlx::query_as::<_, InitExecutionRow>(&format!(
            "SELECT {INIT_COLUMNS} FROM init_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Init executions for a batch at one version, in declaration order.
    pub async fn list_inits(
        &self,
        batch_id: i64,
        runbook_version: i32,
    ) -> Result<Vec<InitExecutionRow>> {
        let rows = sqlx::query_as::<_, InitExecutionRow>(&format!(
            r#"
            SELECT {INIT_COLUMNS} FROM init_executions
            WHERE batch_id = $1 AND runbook_version = $2
            ORDER BY step_index
            "#,
        ))
        .bind(batch_id)
        .bind(runbook_version)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// The lowest-index pending init for a batch, if any.
    pub async fn next_pending_init(
        &self,
        batch_id: i64,
        runbook_version: i32,
    ) -> Result<Option<InitExecutionRow>> {
        let row = sqlx::query_as::<_, InitExecutionRow>(&format!(
            r#"
            SELECT {INIT_COLUMNS} FROM init_executions
            WHERE batch_id = $1 AND runbook_version = $2 AND status = 'pending'
            ORDER BY step_index
            LIMIT 1
            "#,
        ))
        .bind(batch_id)
        .bind(runbook_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Whether any init record exists for (batch, version). Drives rerun-init
    /// on version transitions.
    pub async fn has_inits_for_version(&self, batch_id: i64, runbook_version: i32) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM init_executions WHERE batch_id = $1 AND runbook_version = $2) AS present",
        )
        .bind(batch_id)
        .bind(runbook_version)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("present"))
    }

    pub async fn mark_init_dispatched(&self, id: i64, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'dispatched', last_job_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_init_polling(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'polling',
                poll_started_at = COALESCE(poll_started_at, NOW()),
                last_polled_at = NOW(),
                poll_count = poll_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_init_succeeded(
        &self,
        id: i64,
        result_json: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'succeeded', result = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(result_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_init_failed(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_init_poll_timeout(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'poll_timeout',
                error_message = 'poll timeout exceeded',
                updated_at = NOW()
            WHERE id = $1 AND status = 'polling'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn reset_init_for_retry(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'pending', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('dispatched', 'polling')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn redispatch_init_retry(&self, id: i64, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE init_executions
            SET status = 'dispatched',
                retry_count = retry_count + 1,
                last_job_id = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND retry_count < max_retries
            "#,
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Polling inits whose poll interval has elapsed.
    pub async fn due_polling_inits(&self, now: DateTime<Utc>) -> Result<Vec<InitExecutionRow>> {
        let rows = sqlx::query_as::<_, InitExecutionRow>(&format!(
            r#"
            SELECT {INIT_COLUMNS} FROM init_executions
            WHERE status = 'polling'
              AND last_polled_at + make_interval(secs => COALESCE(poll_interval_sec, 0)::float8) <= $1
            ORDER BY last_polled_at
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
