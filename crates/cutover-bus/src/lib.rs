//! # Cutover Message Bus
//!
//! An at-least-once message bus with subject-based routing, scheduled
//! delivery, and dead-lettering. Internal engine events and outgoing worker
//! jobs both flow through it.
//!
//! The production implementation is PostgreSQL-backed: publishing inserts a
//! row, claiming is `FOR UPDATE SKIP LOCKED` over visible pending rows, and a
//! failed message is rescheduled with backoff until its attempt budget is
//! exhausted and it lands in the dead-letter table. No ordering is promised;
//! the engine's state machine re-establishes order from persisted rows.

pub mod bus;
pub mod memory;
pub mod message;
pub mod postgres;

pub use bus::{BusError, FailureOutcome, MessageBus};
pub use memory::InMemoryBus;
pub use message::{ClaimedMessage, DeadLetter, OutgoingMessage, DEFAULT_MAX_ATTEMPTS};
pub use postgres::PostgresBus;
