//! # Cutover Engine
//!
//! The scheduler tick, the orchestrator handler set, the worker dispatcher,
//! the manual batch service, and the data-source adapters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (lease-pinned tick: query → dynamic table → batch detect   │
//! │   → membership diff → version transition → due phases)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ events
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Message bus                            │
//! │  (engine.events / engine.results / worker.<id> subjects)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ claims
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │  (batch-init, phase-due, member diff, worker results,       │
//! │   poll/retry checks; compare-and-set state machine)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All durable state lives in cutover-storage; handlers are idempotent
//! under duplicate delivery and ordering is re-established from persisted
//! rows, never from the bus.

pub mod datasource;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod manual;
pub mod orchestrator;
pub mod scheduler;

mod steps;

pub use datasource::{
    DataSourceClient, DataSourceError, DataSourceRegistry, StaticDataSource, TableResult, TableRow,
};
pub use dispatch::{JobRequest, WorkerDispatcher};
pub use error::{EngineError, Result};
pub use manual::{AdvanceOutcome, ManualBatchCreated, ManualBatchService};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use scheduler::{Scheduler, SchedulerConfig};
