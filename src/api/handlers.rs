//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ScheduleEntry;
use crate::core::job::{Job, JobCommand};
use crate::core::types::JobName;
use crate::scheduler::{JobManager, RunOnceOptions, SchedulerHandle};
use crate::storage::Storage;

use super::errors::ApiError;
use super::responses::{
    HealthResponse, JobListResponse, MessageResponse, RunListResponse, RunOnceResponse,
    RunResponse, SchedulerStatusResponse,
};

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub manager: Arc<JobManager<S>>,
    /// Present when the API runs inside the scheduler process.
    pub handle: Option<SchedulerHandle>,
    /// Timeout for jobs created without one.
    pub default_timeout: Duration,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            handle: self.handle.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

impl<S: Storage> ApiState<S> {
    fn handle(&self) -> Result<&SchedulerHandle, ApiError> {
        self.handle
            .as_ref()
            .ok_or_else(|| ApiError::ServiceUnavailable("scheduler is not running".to_string()))
    }
}

/// Query parameters for the list_runs endpoint.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// Body of `POST /api/run-once`.
#[derive(Debug, Deserialize)]
pub struct RunOnceRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    /// Omitted means as soon as possible.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RunOnceRequest {
    fn job_command(&self) -> Result<JobCommand, ApiError> {
        match (&self.job_type, &self.command) {
            (Some(kind), None) => Ok(JobCommand::typed(kind.clone(), self.options.clone())),
            (None, Some(command)) if self.options.is_empty() => {
                Ok(JobCommand::shell(command.clone()))
            }
            (None, Some(_)) => Err(ApiError::BadRequest(
                "options only apply to job_type requests".to_string(),
            )),
            _ => Err(ApiError::BadRequest(
                "set exactly one of command or job_type".to_string(),
            )),
        }
    }
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Get scheduler status.
pub async fn get_scheduler_status<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<SchedulerStatusResponse>, ApiError> {
    let status = state.handle()?.status().await?;
    Ok(Json(SchedulerStatusResponse::from(status)))
}

/// Stop the scheduler.
///
/// Responds once the loop has drained its in-flight runs.
pub async fn shutdown_scheduler<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle()?.shutdown().await?;
    Ok(Json(MessageResponse {
        message: "scheduler stopped".to_string(),
    }))
}

/// List all jobs.
pub async fn list_jobs<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<JobListResponse>, ApiError> {
    let jobs = state.manager.list().await?;
    let count = jobs.len();
    Ok(Json(JobListResponse { jobs, count }))
}

/// Add a job described in the config entry shape.
pub async fn create_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(entry): Json<ScheduleEntry>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = entry.to_job(state.default_timeout)?;
    let job = state.manager.add(job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Get a specific job.
pub async fn get_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(name): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.manager.get(&JobName::new(name)).await?;
    Ok(Json(job))
}

/// Remove a job.
pub async fn delete_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.manager.remove(&JobName::new(&name)).await?;
    Ok(Json(MessageResponse {
        message: format!("job '{}' removed", name),
    }))
}

pub async fn enable_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.manager.enable(&JobName::new(&name)).await?;
    Ok(Json(MessageResponse {
        message: format!("job '{}' enabled", name),
    }))
}

pub async fn disable_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.manager.disable(&JobName::new(&name)).await?;
    Ok(Json(MessageResponse {
        message: format!("job '{}' disabled", name),
    }))
}

/// List runs for a job, newest first.
pub async fn list_runs<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(name): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<RunListResponse>, ApiError> {
    let name = JobName::new(name);

    // Verify job exists
    state.manager.get(&name).await?;

    let runs = state.manager.history(Some(&name), query.limit).await?;
    let runs: Vec<RunResponse> = runs.into_iter().map(RunResponse::from).collect();
    let count = runs.len();
    Ok(Json(RunListResponse { runs, count }))
}

/// Queue a one-time job.
pub async fn run_once<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<RunOnceRequest>,
) -> Result<(StatusCode, Json<RunOnceResponse>), ApiError> {
    let command = request.job_command()?;
    let options = RunOnceOptions {
        timeout: request.timeout_secs.map(Duration::from_secs),
        max_retries: request.max_retries,
        description: request.description,
    };
    let job = state.manager.run_once(command, request.at, options).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunOnceResponse {
            message: format!("job '{}' queued", job.name),
            job: job.name.to_string(),
            next_run_at: job.next_run_at,
        }),
    ))
}
