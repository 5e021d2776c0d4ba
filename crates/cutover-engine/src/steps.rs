// Step materialization
//
// Shared by the scheduler (init templates at batch creation), the phase-due
// handler, and the late-joiner path: turning a StepSpec into a fully resolved
// execution row, and turning a persisted row back into a worker job.

use cutover_contracts::CorrelationData;
use cutover_core::template::{self, TemplateContext};
use cutover_core::{RunbookSpec, StepSpec};
use cutover_storage::models::{
    BatchMemberRow, BatchRow, InitExecutionRow, InitStepTemplate, NewExecutionStep,
    StepExecutionRow,
};

use crate::dispatch::JobRequest;
use crate::error::Result;

/// The placeholder-resolution map for a member: source columns overlaid on
/// worker-produced values, so a refreshed data-source cell always wins over a
/// stale step output under the same key.
pub(crate) fn resolution_map(
    member: &BatchMemberRow,
) -> serde_json::Map<String, serde_json::Value> {
    let mut map = member
        .worker_data_json
        .as_object()
        .cloned()
        .unwrap_or_default();
    for (key, value) in member.data_map() {
        map.insert(key, value);
    }
    map
}

/// Resolve one phase step against a member's data into an insertable
/// execution row. Fails with the full unresolved-name list when the member's
/// data cannot satisfy the templates.
pub(crate) fn resolve_member_step(
    spec: &RunbookSpec,
    step: &StepSpec,
    step_index: i32,
    batch: &BatchRow,
    member_map: &serde_json::Map<String, serde_json::Value>,
) -> Result<NewExecutionStep> {
    let ctx = TemplateContext::for_member(batch.id, batch.batch_start_time, member_map);
    let function_name = template::resolve(&step.function, &ctx)?;
    let parameters = template::resolve_map(&step.params, &ctx)?;

    let (poll_interval_sec, poll_timeout_sec) = match &step.poll {
        Some(poll) => (Some(poll.interval_secs()?), Some(poll.timeout_secs()?)),
        None => (None, None),
    };
    let (max_retries, retry_interval_sec) = match spec.effective_retry(step) {
        Some(retry) => (retry.max_retries, Some(retry.interval_secs()?)),
        None => (0, None),
    };

    Ok(NewExecutionStep {
        step_index,
        step_name: step.name.clone(),
        worker_id: step.worker_id.clone(),
        function_name,
        parameters: serde_json::to_value(parameters)?,
        poll_interval_sec,
        poll_timeout_sec,
        max_retries,
        retry_interval_sec,
        on_failure: step.on_failure.clone(),
        output_params: serde_json::to_value(&step.output_params)?,
    })
}

/// Init steps as templates for batch creation; batch-scoped placeholders
/// resolve inside the creation transaction.
pub(crate) fn init_templates(spec: &RunbookSpec) -> Result<Vec<InitStepTemplate>> {
    let mut templates = Vec::with_capacity(spec.init.len());
    for (index, step) in spec.init.iter().enumerate() {
        let (poll_interval_sec, poll_timeout_sec) = match &step.poll {
            Some(poll) => (Some(poll.interval_secs()?), Some(poll.timeout_secs()?)),
            None => (None, None),
        };
        let (max_retries, retry_interval_sec) = match spec.effective_retry(step) {
            Some(retry) => (retry.max_retries, Some(retry.interval_secs()?)),
            None => (0, None),
        };
        templates.push(InitStepTemplate {
            step_index: index as i32,
            step_name: step.name.clone(),
            worker_id: step.worker_id.clone(),
            function: step.function.clone(),
            params: step.params.clone(),
            poll_interval_sec,
            poll_timeout_sec,
            max_retries,
            retry_interval_sec,
            on_failure: step.on_failure.clone(),
        });
    }
    Ok(templates)
}

/// A worker job for a persisted step execution.
pub(crate) fn job_for_step(
    row: &StepExecutionRow,
    runbook_name: &str,
    runbook_version: i32,
) -> JobRequest {
    JobRequest::new(
        row.batch_id,
        row.worker_id.clone(),
        row.function_name.clone(),
        row.parameter_map(),
        CorrelationData::for_step(runbook_name, runbook_version, row.id),
    )
}

/// A worker job for a persisted init execution.
pub(crate) fn job_for_init(row: &InitExecutionRow, runbook_name: &str) -> JobRequest {
    JobRequest::new(
        row.batch_id,
        row.worker_id.clone(),
        row.function_name.clone(),
        row.parameter_map(),
        CorrelationData::for_init(runbook_name, row.runbook_version, row.id),
    )
}
