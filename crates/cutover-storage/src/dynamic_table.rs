// Dynamic per-runbook data tables
//
// Each runbook version owns a side table mirroring its query projection plus
// six reserved columns. Identifiers are validated against the safety regex in
// cutover-core before statement generation; cell values are always bound.

use chrono::{DateTime, Utc};
use cutover_core::ident;
use sqlx::Row;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::repositories::Database;

/// Reserved columns present in every dynamic table
pub const RESERVED_COLUMNS: [&str; 6] = [
    "_row_id",
    "_member_key",
    "_batch_time",
    "_first_seen_at",
    "_last_seen_at",
    "_is_current",
];

/// One data-source row destined for a dynamic table
#[derive(Debug, Clone)]
pub struct DynamicRow {
    pub member_key: String,
    pub batch_time: Option<DateTime<Utc>>,
    /// Cell values aligned with the column list passed to the upsert;
    /// multi-valued cells arrive already serialized as JSON-array text
    pub values: Vec<Option<String>>,
}

impl Database {
    /// Create the dynamic table if needed and make sure every projected
    /// column exists. Projection drift across versions only ever adds
    /// columns.
    #[instrument(skip(self, columns))]
    pub async fn ensure_dynamic_table(&self, table: &str, columns: &[String]) -> Result<()> {
        ident::ensure_safe_identifier(table)?;
        for column in columns {
            ident::ensure_safe_identifier(column)?;
        }

        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                _row_id BIGSERIAL PRIMARY KEY,
                _member_key TEXT NOT NULL UNIQUE,
                _batch_time TIMESTAMPTZ,
                _first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                _last_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                _is_current INT NOT NULL DEFAULT 1
            )
            "#,
        );
        sqlx::query(&create).execute(&self.pool).await?;

        for column in columns {
            let alter = format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column} TEXT");
            sqlx::query(&alter).execute(&self.pool).await?;
        }

        debug!(table, columns = columns.len(), "ensured dynamic table");
        Ok(())
    }

    /// Merge rows by `_member_key`: update still-present rows and stamp
    /// `_last_seen_at`; insert new rows with both seen timestamps.
    #[instrument(skip(self, columns, rows))]
    pub async fn upsert_dynamic_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[DynamicRow],
    ) -> Result<()> {
        ident::ensure_safe_identifier(table)?;
        for column in columns {
            ident::ensure_safe_identifier(column)?;
        }

        let column_list = columns.join(", ");
        let placeholders: Vec<String> = (0..columns.len())
            .map(|i| format!("${}", i + 3))
            .collect();
        let updates: Vec<String> = columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();

        let statement = format!(
            r#"
            INSERT INTO {table} (_member_key, _batch_time, {column_list})
            VALUES ($1, $2, {placeholders})
            ON CONFLICT (_member_key) DO UPDATE
            SET _batch_time = EXCLUDED._batch_time,
                _last_seen_at = NOW(),
                _is_current = 1,
                {updates}
            "#,
            placeholders = placeholders.join(", "),
            updates = updates.join(",\n                "),
        );

        for row in rows {
            let mut query = sqlx::query(&statement)
                .bind(&row.member_key)
                .bind(row.batch_time);
            for value in &row.values {
                query = query.bind(value);
            }
            query.execute(&self.pool).await?;
        }

        debug!(table, rows = rows.len(), "upserted dynamic rows");
        Ok(())
    }

    /// Mark every row whose key is absent from the current set as not
    /// current.
    #[instrument(skip(self, current_keys))]
    pub async fn mark_dynamic_rows_not_current(
        &self,
        table: &str,
        current_keys: &[String],
    ) -> Result<u64> {
        ident::ensure_safe_identifier(table)?;

        let statement = format!(
            r#"
            UPDATE {table}
            SET _is_current = 0
            WHERE _is_current = 1 AND NOT (_member_key = ANY($1))
            "#,
        );
        let result = sqlx::query(&statement)
            .bind(current_keys)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Whether a current row exists for the key (invariant checks, tests).
    pub async fn dynamic_row_is_current(&self, table: &str, member_key: &str) -> Result<bool> {
        ident::ensure_safe_identifier(table)?;

        let statement = format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE _member_key = $1 AND _is_current = 1) AS present",
        );
        let row = sqlx::query(&statement)
            .bind(member_key)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("present"))
    }
}
