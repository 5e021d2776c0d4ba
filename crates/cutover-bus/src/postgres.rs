//! PostgreSQL implementation of MessageBus
//!
//! Backed by the `bus_messages` / `bus_dead_letters` tables (created by the
//! cutover-storage migrations). Claiming uses `FOR UPDATE SKIP LOCKED` so
//! concurrent consumers never contend on the same rows, and scheduled
//! delivery is a `visible_at` column checked at claim time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::bus::{redelivery_delay, BusError, FailureOutcome, MessageBus};
use crate::message::{ClaimedMessage, DeadLetter, OutgoingMessage};

/// PostgreSQL message bus
#[derive(Clone)]
pub struct PostgresBus {
    pool: PgPool,
}

impl PostgresBus {
    /// Create a bus over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageBus for PostgresBus {
    #[instrument(skip(self, message), fields(subject = %message.subject, kind = %message.kind))]
    async fn publish(&self, message: OutgoingMessage) -> Result<Uuid, BusError> {
        let message_id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO bus_messages (id, subject, kind, body, visible_at, max_attempts)
            VALUES ($1, $2, $3, $4, COALESCE($5, NOW()), $6)
            "#,
        )
        .bind(message_id)
        .bind(&message.subject)
        .bind(&message.kind)
        .bind(&message.body)
        .bind(message.visible_at)
        .bind(message.max_attempts)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to publish message: {}", e);
            BusError::Database(e.to_string())
        })?;

        debug!(%message_id, "published message");
        Ok(message_id)
    }

    #[instrument(skip(self, subjects))]
    async fn claim(
        &self,
        consumer: &str,
        subjects: &[String],
        max_messages: usize,
    ) -> Result<Vec<ClaimedMessage>, BusError> {
        if subjects.is_empty() {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM bus_messages
                WHERE status = 'pending'
                  AND subject = ANY($1)
                  AND visible_at <= NOW()
                ORDER BY visible_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE bus_messages m
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE m.id = c.id
            RETURNING m.id, m.subject, m.kind, m.body, m.attempt, m.max_attempts
            "#,
        )
        .bind(subjects)
        .bind(max_messages as i32)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim messages: {}", e);
            BusError::Database(e.to_string())
        })?;

        let claimed: Vec<ClaimedMessage> = rows
            .into_iter()
            .map(|row| ClaimedMessage {
                id: row.get("id"),
                subject: row.get("subject"),
                kind: row.get("kind"),
                body: row.get("body"),
                attempt: row.get("attempt"),
                max_attempts: row.get("max_attempts"),
            })
            .collect();

        if !claimed.is_empty() {
            debug!(consumer, count = claimed.len(), "claimed messages");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn complete(&self, message_id: Uuid) -> Result<(), BusError> {
        let result = sqlx::query(
            r#"
            UPDATE bus_messages
            SET status = 'completed', claimed_by = NULL
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BusError::MessageNotFound(message_id));
        }
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail(&self, message_id: Uuid, error: &str) -> Result<FailureOutcome, BusError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT subject, kind, body, attempt, max_attempts
            FROM bus_messages
            WHERE id = $1 AND status = 'claimed'
            FOR UPDATE
            "#,
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?
        .ok_or(BusError::MessageNotFound(message_id))?;

        let attempt: i32 = row.get("attempt");
        let max_attempts: i32 = row.get("max_attempts");

        let outcome = if attempt >= max_attempts {
            sqlx::query(
                r#"
                INSERT INTO bus_dead_letters
                    (id, original_message_id, subject, kind, body, attempts, last_error)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(message_id)
            .bind(row.get::<String, _>("subject"))
            .bind(row.get::<String, _>("kind"))
            .bind(row.get::<serde_json::Value, _>("body"))
            .bind(attempt)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

            sqlx::query(
                r#"
                UPDATE bus_messages
                SET status = 'dead', last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

            FailureOutcome::DeadLettered
        } else {
            let visible_at = Utc::now() + redelivery_delay(attempt);
            sqlx::query(
                r#"
                UPDATE bus_messages
                SET status = 'pending', claimed_by = NULL, last_error = $2, visible_at = $3
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(error)
            .bind(visible_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

            FailureOutcome::WillRetry {
                next_attempt: attempt + 1,
                visible_at,
            }
        };

        tx.commit()
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        debug!(%message_id, ?outcome, "failed message");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<Uuid>, BusError> {
        let rows = sqlx::query(
            r#"
            UPDATE bus_messages
            SET status = 'pending', claimed_by = NULL
            WHERE status = 'claimed'
              AND claimed_at < NOW() - make_interval(secs => $1)
            RETURNING id
            "#,
        )
        .bind(threshold.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        let ids: Vec<Uuid> = rows.into_iter().map(|r| r.get("id")).collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "reclaimed stale messages");
        }
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(&self, subject: Option<&str>) -> Result<Vec<DeadLetter>, BusError> {
        let rows = match subject {
            Some(subject) => {
                sqlx::query(
                    r#"
                    SELECT id, original_message_id, subject, kind, body, attempts, last_error, dead_at
                    FROM bus_dead_letters
                    WHERE subject = $1
                    ORDER BY dead_at DESC
                    "#,
                )
                .bind(subject)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, original_message_id, subject, kind, body, attempts, last_error, dead_at
                    FROM bus_dead_letters
                    ORDER BY dead_at DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| BusError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| DeadLetter {
                id: row.get("id"),
                original_message_id: row.get("original_message_id"),
                subject: row.get("subject"),
                kind: row.get("kind"),
                body: row.get("body"),
                attempts: row.get("attempts"),
                last_error: row.get("last_error"),
                dead_at: row.get("dead_at"),
            })
            .collect())
    }
}
