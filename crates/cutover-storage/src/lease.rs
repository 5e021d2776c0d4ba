// Distributed lease
//
// A named, time-bounded exclusive lease over a single table row. The
// scheduler acquires `scheduler-tick` before every tick so only one instance
// drives detection at a time; a background task renews at half the TTL.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::Result;
use crate::repositories::Database;

impl Database {
    /// Try to acquire a lease. Succeeds when the lease is free, expired, or
    /// already held by this owner.
    #[instrument(skip(self, ttl))]
    pub async fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, owner, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE leases.expires_at < NOW() OR leases.owner = EXCLUDED.owner
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() > 0;
        if acquired {
            debug!(name, owner, "acquired lease");
        }
        Ok(acquired)
    }

    /// Extend a held lease. Returns false when the lease is no longer ours.
    pub async fn renew_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET expires_at = NOW() + make_interval(secs => $3)
            WHERE name = $1 AND owner = $2
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release a held lease. Releasing an expired or stolen lease is a
    /// no-op.
    pub async fn release_lease(&self, name: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
