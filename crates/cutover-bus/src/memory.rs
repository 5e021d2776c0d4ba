//! In-memory implementation of MessageBus for testing
//!
//! Mirrors the PostgreSQL semantics: subject filtering, visibility time,
//! bounded redelivery with dead-lettering, stale-claim recovery. UUIDv7
//! message ids are time-ordered, so iterating the BTreeMap yields
//! publish order.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::bus::{redelivery_delay, BusError, FailureOutcome, MessageBus};
use crate::message::{ClaimedMessage, DeadLetter, OutgoingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageStatus {
    Pending,
    Claimed,
    Completed,
    Dead,
}

struct MessageState {
    subject: String,
    kind: String,
    body: serde_json::Value,
    status: MessageStatus,
    visible_at: DateTime<Utc>,
    attempt: i32,
    max_attempts: i32,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// In-memory message bus
///
/// Primarily for tests: engine suites publish through the trait and use the
/// inspection helpers to assert on what was sent without a database.
#[derive(Default)]
pub struct InMemoryBus {
    messages: RwLock<BTreeMap<Uuid, MessageState>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending messages on a subject, in publish order (test helper).
    pub fn pending_on(&self, subject: &str) -> Vec<(Uuid, serde_json::Value)> {
        self.messages
            .read()
            .iter()
            .filter(|(_, m)| m.status == MessageStatus::Pending && m.subject == subject)
            .map(|(id, m)| (*id, m.body.clone()))
            .collect()
    }

    /// Every message ever published, with subject, kind, body, and the
    /// visibility time it was scheduled for (test helper).
    pub fn all_messages(&self) -> Vec<(String, String, serde_json::Value, DateTime<Utc>)> {
        self.messages
            .read()
            .values()
            .map(|m| (m.subject.clone(), m.kind.clone(), m.body.clone(), m.visible_at))
            .collect()
    }

    /// Number of live (pending or claimed) messages (test helper).
    pub fn live_count(&self) -> usize {
        self.messages
            .read()
            .values()
            .filter(|m| matches!(m.status, MessageStatus::Pending | MessageStatus::Claimed))
            .count()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: OutgoingMessage) -> Result<Uuid, BusError> {
        let message_id = Uuid::now_v7();
        self.messages.write().insert(
            message_id,
            MessageState {
                subject: message.subject,
                kind: message.kind,
                body: message.body,
                status: MessageStatus::Pending,
                visible_at: message.visible_at.unwrap_or_else(Utc::now),
                attempt: 0,
                max_attempts: message.max_attempts,
                claimed_at: None,
                last_error: None,
            },
        );
        Ok(message_id)
    }

    async fn claim(
        &self,
        _consumer: &str,
        subjects: &[String],
        max_messages: usize,
    ) -> Result<Vec<ClaimedMessage>, BusError> {
        let now = Utc::now();
        let mut messages = self.messages.write();
        let mut claimed = Vec::new();

        for (id, state) in messages.iter_mut() {
            if claimed.len() >= max_messages {
                break;
            }
            if state.status == MessageStatus::Pending
                && state.visible_at <= now
                && subjects.contains(&state.subject)
            {
                state.status = MessageStatus::Claimed;
                state.claimed_at = Some(now);
                state.attempt += 1;
                claimed.push(ClaimedMessage {
                    id: *id,
                    subject: state.subject.clone(),
                    kind: state.kind.clone(),
                    body: state.body.clone(),
                    attempt: state.attempt,
                    max_attempts: state.max_attempts,
                });
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, message_id: Uuid) -> Result<(), BusError> {
        let mut messages = self.messages.write();
        let state = messages
            .get_mut(&message_id)
            .filter(|m| m.status == MessageStatus::Claimed)
            .ok_or(BusError::MessageNotFound(message_id))?;
        state.status = MessageStatus::Completed;
        Ok(())
    }

    async fn fail(&self, message_id: Uuid, error: &str) -> Result<FailureOutcome, BusError> {
        let mut messages = self.messages.write();
        let state = messages
            .get_mut(&message_id)
            .filter(|m| m.status == MessageStatus::Claimed)
            .ok_or(BusError::MessageNotFound(message_id))?;

        state.last_error = Some(error.to_string());
        if state.attempt >= state.max_attempts {
            state.status = MessageStatus::Dead;
            self.dead_letters.write().push(DeadLetter {
                id: Uuid::now_v7(),
                original_message_id: message_id,
                subject: state.subject.clone(),
                kind: state.kind.clone(),
                body: state.body.clone(),
                attempts: state.attempt,
                last_error: error.to_string(),
                dead_at: Utc::now(),
            });
            Ok(FailureOutcome::DeadLettered)
        } else {
            let visible_at = Utc::now() + redelivery_delay(state.attempt);
            state.status = MessageStatus::Pending;
            state.visible_at = visible_at;
            Ok(FailureOutcome::WillRetry {
                next_attempt: state.attempt + 1,
                visible_at,
            })
        }
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<Uuid>, BusError> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(threshold.as_millis() as i64);
        let mut reclaimed = Vec::new();
        for (id, state) in self.messages.write().iter_mut() {
            if state.status == MessageStatus::Claimed
                && state.claimed_at.is_some_and(|at| at < cutoff)
            {
                state.status = MessageStatus::Pending;
                reclaimed.push(*id);
            }
        }
        Ok(reclaimed)
    }

    async fn list_dead_letters(&self, subject: Option<&str>) -> Result<Vec<DeadLetter>, BusError> {
        Ok(self
            .dead_letters
            .read()
            .iter()
            .filter(|d| subject.is_none_or(|s| d.subject == s))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(subject: &str) -> OutgoingMessage {
        OutgoingMessage::new(subject, "test", &json!({"n": 1})).unwrap()
    }

    #[tokio::test]
    async fn test_subject_filtering() {
        let bus = InMemoryBus::new();
        bus.publish(message("a")).await.unwrap();
        bus.publish(message("b")).await.unwrap();

        let claimed = bus.claim("c1", &["a".to_string()], 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].subject, "a");
    }

    #[tokio::test]
    async fn test_claimed_messages_are_exclusive() {
        let bus = InMemoryBus::new();
        bus.publish(message("a")).await.unwrap();

        let first = bus.claim("c1", &["a".to_string()], 10).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = bus.claim("c2", &["a".to_string()], 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_delivery_invisible_until_due() {
        let bus = InMemoryBus::new();
        bus.publish(
            message("a").with_visible_at(Utc::now() + chrono::Duration::minutes(5)),
        )
        .await
        .unwrap();

        let claimed = bus.claim("c1", &["a".to_string()], 10).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(bus.live_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_reschedules_then_dead_letters() {
        let bus = InMemoryBus::new();
        bus.publish(message("a").with_max_attempts(2)).await.unwrap();

        let claimed = bus.claim("c1", &["a".to_string()], 10).await.unwrap();
        let outcome = bus.fail(claimed[0].id, "boom").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::WillRetry { next_attempt: 2, .. }));

        // Make it visible again without waiting for backoff
        bus.messages.write().get_mut(&claimed[0].id).unwrap().visible_at = Utc::now();

        let claimed = bus.claim("c1", &["a".to_string()], 10).await.unwrap();
        assert_eq!(claimed[0].attempt, 2);
        let outcome = bus.fail(claimed[0].id, "boom again").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::DeadLettered));

        let dlq = bus.list_dead_letters(Some("a")).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].attempts, 2);
        assert_eq!(dlq[0].last_error, "boom again");
    }

    #[tokio::test]
    async fn test_complete_is_terminal() {
        let bus = InMemoryBus::new();
        bus.publish(message("a")).await.unwrap();
        let claimed = bus.claim("c1", &["a".to_string()], 10).await.unwrap();
        bus.complete(claimed[0].id).await.unwrap();

        assert!(bus.complete(claimed[0].id).await.is_err());
        assert_eq!(bus.live_count(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_stale() {
        let bus = InMemoryBus::new();
        bus.publish(message("a")).await.unwrap();
        let claimed = bus.claim("c1", &["a".to_string()], 10).await.unwrap();

        // Nothing is stale yet
        let reclaimed = bus.reclaim_stale(Duration::from_secs(60)).await.unwrap();
        assert!(reclaimed.is_empty());

        let reclaimed = bus.reclaim_stale(Duration::from_secs(0)).await.unwrap();
        assert_eq!(reclaimed, vec![claimed[0].id]);

        let again = bus.claim("c2", &["a".to_string()], 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempt, 2);
    }
}
