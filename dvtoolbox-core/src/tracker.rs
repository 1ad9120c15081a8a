//! Tracking of server-side asynchronous jobs.
//!
//! A job moves `Pending -> Running -> Succeeded | Failed | Canceled`. The
//! tracker starts it by executing a triggering operation, then observes it
//! through a [`JobProbe`]. Observation is a seam: an async operation row for
//! export and publish, an import job row (resolved later by business key)
//! for import.
//!
//! Remote faults inside poll loops are logged and treated as "not yet".
//! Waiting for completion has no deadline.

use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::contract::{OperationRequest, Query, RemoteClient};
use crate::error::{RemoteError, Result, ToolboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    /// Maps an `asyncoperation.statuscode`. Waiting states count as pending.
    pub fn from_status_code(code: i64) -> JobState {
        match code {
            20..=22 => JobState::Running,
            30 => JobState::Succeeded,
            31 => JobState::Failed,
            32 => JobState::Canceled,
            _ => JobState::Pending,
        }
    }
}

/// Handle to one remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncJob {
    pub operation_id: Uuid,
    /// Secondary id the job is tracked under once known (import job, export job).
    pub correlation_id: Option<Uuid>,
    pub state: JobState,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

impl AsyncJob {
    pub fn new(operation_id: Uuid) -> Self {
        Self {
            operation_id,
            correlation_id: None,
            state: JobState::Pending,
            progress: None,
            message: None,
        }
    }

    fn observe(&mut self, observation: JobObservation) {
        self.state = observation.state;
        if observation.progress.is_some() {
            self.progress = observation.progress;
        }
        if observation.message.is_some() {
            self.message = observation.message;
        }
    }
}

/// One poll result.
#[derive(Debug, Clone, PartialEq)]
pub struct JobObservation {
    pub state: JobState,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

impl JobObservation {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            progress: None,
            message: None,
        }
    }

    pub fn running(progress: Option<f64>) -> Self {
        Self {
            state: JobState::Running,
            progress,
            message: None,
        }
    }

    pub fn finished(state: JobState, message: Option<String>) -> Self {
        Self {
            state,
            progress: None,
            message,
        }
    }
}

/// Reads the current state of a job.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait JobProbe: Send + Sync {
    async fn observe(&self, job: &AsyncJob) -> Result<JobObservation, RemoteError>;
}

/// Observes the `asyncoperation` row behind `job.operation_id`.
pub struct AsyncOperationProbe<'a> {
    client: &'a dyn RemoteClient,
}

impl<'a> AsyncOperationProbe<'a> {
    pub fn new(client: &'a dyn RemoteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobProbe for AsyncOperationProbe<'_> {
    async fn observe(&self, job: &AsyncJob) -> Result<JobObservation, RemoteError> {
        let query = Query::new("asyncoperation")
            .select(&["statuscode", "friendlymessage", "message"])
            .eq("asyncoperationid", job.operation_id);
        let rows = self.client.query(&query).await?;
        let Some(row) = rows.first() else {
            return Ok(JobObservation::pending());
        };
        let state = JobState::from_status_code(row.int("statuscode").unwrap_or_default());
        let message = row
            .text("friendlymessage")
            .or_else(|| row.text("message"))
            .map(str::to_string);
        Ok(JobObservation {
            state,
            progress: None,
            message,
        })
    }
}

/// Reads progress from the `importjob` row behind `job.correlation_id` and,
/// once that row is completed, the outcome from the async operation.
pub struct ImportJobProbe<'a> {
    client: &'a dyn RemoteClient,
}

impl<'a> ImportJobProbe<'a> {
    pub fn new(client: &'a dyn RemoteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobProbe for ImportJobProbe<'_> {
    async fn observe(&self, job: &AsyncJob) -> Result<JobObservation, RemoteError> {
        let Some(import_job_id) = job.correlation_id else {
            return Ok(JobObservation::pending());
        };
        let query = Query::new("importjob")
            .select(&["progress", "completedon"])
            .eq("importjobid", import_job_id);
        let rows = self.client.query(&query).await?;
        let Some(row) = rows.first() else {
            return Ok(JobObservation::pending());
        };
        let progress = row.float("progress");
        if !row.has_value("completedon") {
            return Ok(JobObservation::running(progress));
        }

        let outcome = AsyncOperationProbe::new(self.client).observe(job).await?;
        if outcome.state.is_terminal() {
            Ok(JobObservation {
                progress: Some(100.0),
                ..outcome
            })
        } else {
            // Import job is done but the operation has not settled yet.
            Ok(JobObservation::running(Some(100.0)))
        }
    }
}

/// The operation that starts a job and where its ids come back in the response.
#[derive(Debug, Clone)]
pub struct JobTrigger {
    pub request: OperationRequest,
    pub operation_id_field: String,
    pub correlation_field: Option<String>,
}

impl JobTrigger {
    /// Trigger whose response carries `AsyncOperationId`.
    pub fn async_operation(request: OperationRequest) -> Self {
        Self {
            request,
            operation_id_field: "AsyncOperationId".to_string(),
            correlation_field: None,
        }
    }

    pub fn correlated_by(mut self, field: &str) -> Self {
        self.correlation_field = Some(field.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub operation_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub message: Option<String>,
    pub polls: u32,
}

fn read_id(response: &serde_json::Value, field: &str) -> Result<Uuid, RemoteError> {
    response
        .get(field)
        .and_then(serde_json::Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| RemoteError::Decode(format!("response has no '{field}' id")))
}

pub struct AsyncOperationTracker<'a> {
    client: &'a dyn RemoteClient,
}

impl<'a> AsyncOperationTracker<'a> {
    pub fn new(client: &'a dyn RemoteClient) -> Self {
        Self { client }
    }

    /// Issue the triggering request. Any fault here is fatal.
    pub async fn start(&self, trigger: &JobTrigger) -> Result<AsyncJob> {
        info!(operation = %trigger.request.name, "[JOB] Starting async operation");
        let response = self.client.execute(&trigger.request).await.map_err(|e| {
            error!(operation = %trigger.request.name, error = %e, "[JOB][ERROR] Failed to start async operation");
            e
        })?;
        let operation_id = read_id(&response, &trigger.operation_id_field)?;
        let mut job = AsyncJob::new(operation_id);
        if let Some(field) = &trigger.correlation_field {
            job.correlation_id = Some(read_id(&response, field)?);
        }
        info!(operation = %trigger.request.name, %operation_id, correlation_id = ?job.correlation_id, "[JOB] Async operation queued");
        Ok(job)
    }

    /// Poll until the job leaves `Pending`. Returns false when `max_attempts`
    /// polls all saw it pending.
    pub async fn wait_for_start(
        &self,
        job: &mut AsyncJob,
        probe: &dyn JobProbe,
        max_attempts: u32,
        interval: Duration,
    ) -> bool {
        for attempt in 1..=max_attempts {
            match probe.observe(job).await {
                Ok(observation) => {
                    job.observe(observation);
                    if job.state != JobState::Pending {
                        debug!(operation_id = %job.operation_id, attempt, state = ?job.state, "[JOB] Job started");
                        return true;
                    }
                }
                Err(e) => {
                    warn!(operation_id = %job.operation_id, attempt, error = %e, "[JOB] Poll failed while waiting for start, retrying");
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        warn!(operation_id = %job.operation_id, max_attempts, "[JOB] Job did not leave pending within the start check");
        false
    }

    /// Find the durable tracking record for `job`: the first row `query`
    /// returns. Sleeps before each attempt since the record appears only
    /// after the job has started.
    pub async fn resolve_tracking_id(
        &self,
        job: &mut AsyncJob,
        query: &Query,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<Uuid> {
        for attempt in 1..=max_attempts {
            tokio::time::sleep(interval).await;
            match self.client.query(query).await {
                Ok(rows) => {
                    if let Some(id) = rows.first().and_then(|r| r.record_id()) {
                        info!(operation_id = %job.operation_id, tracking_id = %id, attempt, "[JOB] Resolved tracking record");
                        job.correlation_id = Some(id);
                        return Ok(id);
                    }
                    debug!(entity = %query.entity, attempt, "[JOB] Tracking record not there yet");
                }
                Err(e) => {
                    warn!(entity = %query.entity, attempt, error = %e, "[JOB] Poll failed while resolving tracking record, retrying");
                }
            }
        }
        error!(entity = %query.entity, filter = %query.describe(), max_attempts, "[JOB][ERROR] Could not resolve tracking record");
        Err(ToolboxError::JobNotResolved {
            key: format!("{} where {}", query.entity, query.describe()),
            attempts: max_attempts,
        })
    }

    /// Poll until a terminal state. `on_progress` runs after every poll whose
    /// job carries a progress value.
    pub async fn wait_for_completion(
        &self,
        job: &mut AsyncJob,
        probe: &dyn JobProbe,
        interval: Duration,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> Result<JobOutcome> {
        let mut polls = 0u32;
        while !job.state.is_terminal() {
            if polls > 0 {
                tokio::time::sleep(interval).await;
            }
            polls += 1;
            match probe.observe(job).await {
                Ok(observation) => {
                    job.observe(observation);
                    debug!(operation_id = %job.operation_id, polls, state = ?job.state, progress = ?job.progress, "[JOB] Polled");
                    if let Some(progress) = job.progress {
                        on_progress(progress);
                    }
                }
                Err(e) => {
                    warn!(operation_id = %job.operation_id, polls, error = %e, "[JOB] Poll failed, retrying");
                }
            }
        }

        match job.state {
            JobState::Succeeded => {
                info!(operation_id = %job.operation_id, polls, "[JOB] Async operation succeeded");
                Ok(JobOutcome {
                    operation_id: job.operation_id,
                    correlation_id: job.correlation_id,
                    message: job.message.clone(),
                    polls,
                })
            }
            state => {
                let message = job
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("job ended as {state:?} without a message"));
                error!(operation_id = %job.operation_id, ?state, %message, "[JOB][ERROR] Async operation did not succeed");
                Err(ToolboxError::JobFailed {
                    job_id: job.operation_id,
                    message,
                })
            }
        }
    }
}
