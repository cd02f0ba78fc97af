use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::scheduler::{Job, JobQueue, JobStatus};

/// Header carrying the shared secret on every request.
pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Clone)]
pub struct ServiceState {
    pub queue: Arc<JobQueue>,
    api_key: Arc<str>,
}

impl ServiceState {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            queue: Arc::new(JobQueue::new()),
            api_key: Arc::from(api_key.into()),
        }
    }
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(MessageResponse { message: text.into() })).into_response()
}

fn error(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: text.into() })).into_response()
}

pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/add_job", post(add_job_handler))
        .route("/get_job", post(get_job_handler))
        .route("/stop_server", post(stop_server_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` fires.
///
/// Shutdown also stops the queue so long-polling `get_job` requests return
/// and the server can drain.
pub async fn serve(
    listener: TcpListener,
    state: ServiceState,
    shutdown: CancellationToken,
) -> Result<()> {
    let queue = state.queue.clone();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            queue.stop();
        })
        .await?;
    Ok(())
}

pub async fn run_service(config: ServiceConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "Starting scheduler service");
    serve(listener, ServiceState::new(config.api_key), shutdown).await
}

async fn require_api_key(
    State(state): State<ServiceState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided != Some(&*state.api_key) {
        tracing::warn!(path = %request.uri().path(), "Rejected request with bad API key");
        return error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    next.run(request).await
}

/// Stamp an incoming job as queued. A job that skipped the client-side
/// submit step is marked submitted first.
fn enqueue_stamp(mut job: Job) -> Result<Job> {
    if job.status == JobStatus::Pending {
        job.mark_submitted()?;
    }
    job.mark_queued()?;
    Ok(job)
}

async fn add_job_handler(State(state): State<ServiceState>, body: Bytes) -> Response {
    let job = match serde_json::from_slice::<Job>(&body)
        .map_err(crate::error::DispatchError::from)
        .and_then(enqueue_stamp)
    {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, "Error adding job");
            return error(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    tracing::info!(job = %job.name, "Job added");
    state.queue.push(job);
    message(StatusCode::OK, "Job added successfully")
}

async fn get_job_handler(State(state): State<ServiceState>) -> Response {
    match state.queue.pop().await {
        Ok(job) => {
            tracing::info!(job = %job.name, "Job handed to worker");
            (StatusCode::OK, Json(job)).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Error getting job");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn stop_server_handler(State(state): State<ServiceState>) -> Response {
    state.queue.stop();
    tracing::info!("Scheduler stopping, pollers will drain the queue");
    message(StatusCode::OK, "Server stopping")
}
