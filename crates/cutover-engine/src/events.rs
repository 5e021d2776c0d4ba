// Internal event publication helpers

use chrono::{DateTime, Utc};
use cutover_bus::{MessageBus, OutgoingMessage};
use cutover_contracts::{EngineEvent, EVENTS_SUBJECT};

use crate::error::Result;

/// Publish an engine event on the internal events subject.
pub async fn publish_event(bus: &dyn MessageBus, event: &EngineEvent) -> Result<()> {
    let message = OutgoingMessage::new(EVENTS_SUBJECT, event.kind(), event)?;
    bus.publish(message).await?;
    Ok(())
}

/// Publish an engine event with a scheduled delivery time (retry checks).
pub async fn publish_event_at(
    bus: &dyn MessageBus,
    event: &EngineEvent,
    visible_at: DateTime<Utc>,
) -> Result<()> {
    let message =
        OutgoingMessage::new(EVENTS_SUBJECT, event.kind(), event)?.with_visible_at(visible_at);
    bus.publish(message).await?;
    Ok(())
}
