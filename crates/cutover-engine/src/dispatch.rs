// Worker dispatcher
//
// Translates a dispatch request into a typed bus message: the subject routes
// to the worker pool, the body is the serialized job, and the correlation
// data lets the result handler re-locate the originating execution row.
// A scheduled enqueue time is honored for retries and late polls.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cutover_bus::{MessageBus, OutgoingMessage};
use cutover_contracts::{worker_subject, CorrelationData, WorkerJob};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;

/// A job ready for routing to one worker pool
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub batch_id: i64,
    pub worker_id: String,
    pub function_name: String,
    pub parameters: BTreeMap<String, String>,
    pub correlation_data: CorrelationData,
    /// Deliver no earlier than this (retry backoff, poll cadence)
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
}

impl JobRequest {
    pub fn new(
        batch_id: i64,
        worker_id: impl Into<String>,
        function_name: impl Into<String>,
        parameters: BTreeMap<String, String>,
        correlation_data: CorrelationData,
    ) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            batch_id,
            worker_id: worker_id.into(),
            function_name: function_name.into(),
            parameters,
            correlation_data,
            scheduled_enqueue_time: None,
        }
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_scheduled_enqueue_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_enqueue_time = Some(at);
        self
    }
}

/// Publishes worker jobs onto the bus
#[derive(Clone)]
pub struct WorkerDispatcher {
    bus: Arc<dyn MessageBus>,
}

impl WorkerDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Publish one job to its worker's subject. Returns the job id.
    #[instrument(skip(self, request), fields(worker_id = %request.worker_id, function = %request.function_name))]
    pub async fn dispatch(&self, request: JobRequest) -> Result<Uuid> {
        let job = WorkerJob {
            job_id: request.job_id,
            batch_id: request.batch_id,
            function_name: request.function_name,
            parameters: request.parameters,
            correlation_data: request.correlation_data,
        };

        let mut message =
            OutgoingMessage::new(worker_subject(&request.worker_id), "worker-job", &job)?;
        if let Some(at) = request.scheduled_enqueue_time {
            message = message.with_visible_at(at);
        }

        self.bus.publish(message).await?;
        debug!(job_id = %request.job_id, "dispatched worker job");
        Ok(request.job_id)
    }
}
