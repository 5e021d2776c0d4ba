//! Bus message envelope types

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::BusError;

/// Default redelivery budget before a message is dead-lettered
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// A message to publish
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Routing subject, e.g. `engine.events` or `worker.mailmover`
    pub subject: String,
    /// Payload discriminator for logs and dead-letter triage
    pub kind: String,
    pub body: serde_json::Value,
    /// Scheduled delivery: the message is invisible to consumers before this
    pub visible_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl OutgoingMessage {
    /// Build a message from any serializable payload.
    pub fn new(
        subject: impl Into<String>,
        kind: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, BusError> {
        Ok(Self {
            subject: subject.into(),
            kind: kind.into(),
            body: serde_json::to_value(payload)
                .map_err(|e| BusError::Serialization(e.to_string()))?,
            visible_at: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Delay delivery until `at`.
    pub fn with_visible_at(mut self, at: DateTime<Utc>) -> Self {
        self.visible_at = Some(at);
        self
    }

    /// Override the redelivery budget.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// A message claimed by a consumer
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub id: Uuid,
    pub subject: String,
    pub kind: String,
    pub body: serde_json::Value,
    /// Current attempt, 1-based
    pub attempt: i32,
    pub max_attempts: i32,
}

impl ClaimedMessage {
    /// Deserialize the body into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| BusError::Serialization(e.to_string()))
    }
}

/// A message that exhausted its redelivery budget
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub original_message_id: Uuid,
    pub subject: String,
    pub kind: String,
    pub body: serde_json::Value,
    pub attempts: i32,
    pub last_error: String,
    pub dead_at: DateTime<Utc>,
}
