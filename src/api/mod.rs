//! HTTP control API for the harvest scheduler.
//!
//! Provides REST endpoints for managing the job table, queuing one-time jobs,
//! reading run history and controlling the scheduler.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{ApiState, RunOnceRequest};
pub use responses::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::scheduler::{JobManager, SchedulerHandle};
use crate::storage::Storage;

/// Build the API router with all endpoints.
pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Scheduler control
        .route(
            "/api/scheduler/status",
            get(handlers::get_scheduler_status::<S>),
        )
        .route(
            "/api/scheduler/shutdown",
            post(handlers::shutdown_scheduler::<S>),
        )
        // Jobs
        .route(
            "/api/jobs",
            get(handlers::list_jobs::<S>).post(handlers::create_job::<S>),
        )
        .route(
            "/api/jobs/{name}",
            get(handlers::get_job::<S>).delete(handlers::delete_job::<S>),
        )
        .route("/api/jobs/{name}/enable", post(handlers::enable_job::<S>))
        .route("/api/jobs/{name}/disable", post(handlers::disable_job::<S>))
        .route("/api/jobs/{name}/runs", get(handlers::list_runs::<S>))
        // One-time queue
        .route("/api/run-once", post(handlers::run_once::<S>))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from scheduler components.
///
/// When `handle` is given, "run now" requests wake the scheduler loop.
pub fn create_api_state<S: Storage>(
    manager: JobManager<S>,
    handle: Option<SchedulerHandle>,
    default_timeout: Duration,
) -> ApiState<S> {
    let manager = match &handle {
        Some(handle) => manager.with_handle(handle.clone()),
        None => manager,
    };
    ApiState {
        manager: Arc::new(manager),
        handle,
        default_timeout,
    }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: Storage + 'static>(
    config: &ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
