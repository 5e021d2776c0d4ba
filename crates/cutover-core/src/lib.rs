// Core Domain Logic
//
// Pure logic for the cutover workflow engine: everything here is I/O-free so
// the planner, template resolver, and CSV surfaces can be tested without a
// database or bus.
//
// Key design decisions:
// - Runbook specifications are JSON documents validated once at publish time;
//   the typed model (RunbookSpec) is what the scheduler and orchestrator see
// - Offsets parse to whole minutes, durations to seconds; both share the
//   s/m/h/d suffix grammar
// - Template resolution is all-or-nothing per step: every unresolved name is
//   reported in one error so a member can be skipped with a single warning
// - Identifiers destined for generated SQL go through one safety check

pub mod csvio;
pub mod error;
pub mod ident;
pub mod offset;
pub mod planner;
pub mod projection;
pub mod runbook;
pub mod template;

pub use error::{CoreError, Result};
pub use planner::{
    plan_new_batch, plan_version_transition, ExistingPhase, OverdueBehavior, PlannedPhase,
    PlannedPhaseStatus, TransitionPlan,
};
pub use runbook::{
    dynamic_table_name, BatchTimeMode, DataSourceSpec, DataSourceType, MultiValuedColumn,
    MultiValuedFormat, PhaseSpec, PollSpec, RetrySpec, RunbookSpec, StepSpec,
};
pub use template::{TemplateContext, BATCH_ID, BATCH_START_TIME};
