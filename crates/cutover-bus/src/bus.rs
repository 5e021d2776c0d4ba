//! MessageBus trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::{ClaimedMessage, DeadLetter, OutgoingMessage};

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Message not found (already completed or never existed)
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Outcome of failing a claimed message
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Message goes back to pending and becomes visible at the given time
    WillRetry {
        next_attempt: i32,
        visible_at: DateTime<Utc>,
    },

    /// Redelivery budget exhausted; message copied to the dead-letter queue
    DeadLettered,
}

/// At-least-once message bus with subject filtering and scheduled delivery
///
/// Implementations must be safe for concurrent claiming from multiple
/// consumers; a message is delivered to exactly one claimer at a time and is
/// redelivered when the claimer fails it or goes stale.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message. Returns its id.
    async fn publish(&self, message: OutgoingMessage) -> Result<Uuid, BusError>;

    /// Claim up to `max_messages` visible messages on the given subjects.
    async fn claim(
        &self,
        consumer: &str,
        subjects: &[String],
        max_messages: usize,
    ) -> Result<Vec<ClaimedMessage>, BusError>;

    /// Acknowledge successful handling of a claimed message.
    async fn complete(&self, message_id: Uuid) -> Result<(), BusError>;

    /// Report failed handling. The message is rescheduled with backoff or
    /// dead-lettered when its budget is exhausted.
    async fn fail(&self, message_id: Uuid, error: &str) -> Result<FailureOutcome, BusError>;

    /// Return claimed-but-unacknowledged messages older than `threshold` to
    /// pending so a crashed consumer's work is redelivered.
    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<Uuid>, BusError>;

    /// List dead-lettered messages, optionally filtered by subject.
    async fn list_dead_letters(&self, subject: Option<&str>) -> Result<Vec<DeadLetter>, BusError>;
}

/// Redelivery backoff: exponential in the attempt number with ±10% jitter,
/// capped at five minutes.
pub(crate) fn redelivery_delay(attempt: i32) -> chrono::Duration {
    use rand::Rng;

    let base = 5.0_f64 * 2.0_f64.powi((attempt - 1).max(0));
    let capped = base.min(300.0);
    let jitter = capped * 0.1;
    let secs = capped + rand::thread_rng().gen_range(-jitter..=jitter);
    chrono::Duration::milliseconds((secs * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_delay_grows_and_caps() {
        let first = redelivery_delay(1);
        assert!(first >= chrono::Duration::seconds(4));
        assert!(first <= chrono::Duration::seconds(6));

        let late = redelivery_delay(20);
        assert!(late <= chrono::Duration::seconds(330));
        assert!(late >= chrono::Duration::seconds(270));
    }
}
