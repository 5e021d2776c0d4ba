// Storage layer for the Cutover engine
// PostgreSQL-backed persistence: runbooks, batches, members, phase/step/init
// executions, dynamic per-runbook data tables, and the scheduler lease.

pub mod dynamic_table;
pub mod error;
pub mod executions;
pub mod lease;
pub mod models;
pub mod repositories;

pub use dynamic_table::{DynamicRow, RESERVED_COLUMNS};
pub use error::{Result, StorageError};
pub use repositories::Database;
