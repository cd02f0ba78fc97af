//! Backends that accept jobs and drive them toward execution.
//!
//! Every backend implements [`Executor`]. A session is bracketed by
//! [`Executor::start`] and [`Executor::stop`]; [`run_session`] pairs the two
//! so `stop` runs on every exit path and the body's error (or panic) is
//! surfaced once cleanup has finished.
//!
//! # Backends
//!
//! - [`LocalExecutor`]: child processes on a bounded pool
//! - [`SlurmExecutor`] / [`PreallocatedSlurmExecutor`]: deferred batch scripts
//! - [`RemoteQueueExecutor`]: pushes jobs to a scheduler service
//! - [`NoopExecutor`], [`JsonLinesExecutor`]: dry runs
//!
//! Which backend a configuration produces is decided by an
//! [`ExecutorRegistry`].

pub mod jsonl;
pub mod local;
pub mod noop;
pub mod registry;
pub mod remote;
pub mod slurm;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{DispatchError, Result};
use crate::events::EventBus;
use crate::scheduler::{Job, JobStatus};

pub use jsonl::JsonLinesExecutor;
pub use local::LocalExecutor;
pub use noop::NoopExecutor;
pub use registry::{ExecutorFactory, ExecutorRegistry};
pub use remote::RemoteQueueExecutor;
pub use slurm::{PreallocatedSlurmExecutor, SlurmExecutor};

/// Tag identifying a backend; one per [`ExecutorConfig`](crate::config::ExecutorConfig) variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Local,
    Slurm,
    PreallocatedSlurm,
    Remote,
    Noop,
    JsonLines,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 6] = [
        ExecutorKind::Local,
        ExecutorKind::Slurm,
        ExecutorKind::PreallocatedSlurm,
        ExecutorKind::Remote,
        ExecutorKind::Noop,
        ExecutorKind::JsonLines,
    ];
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Local => write!(f, "local"),
            ExecutorKind::Slurm => write!(f, "slurm"),
            ExecutorKind::PreallocatedSlurm => write!(f, "preallocated-slurm"),
            ExecutorKind::Remote => write!(f, "remote"),
            ExecutorKind::Noop => write!(f, "noop"),
            ExecutorKind::JsonLines => write!(f, "jsonl"),
        }
    }
}

#[async_trait]
pub trait Executor: Send {
    fn kind(&self) -> ExecutorKind;

    /// Status events for jobs handled by this executor.
    fn events(&self) -> &EventBus;

    /// Launch the event bus and any backend resources. Idempotent.
    async fn start(&mut self) -> Result<()>;

    /// Accept a `Pending` job. Publishes at least `Submitted`.
    async fn submit(&mut self, job: Job) -> Result<()>;

    /// Drain and release resources, writing deferred artifacts if any.
    ///
    /// When `error` is set, cleanup still runs and the error is returned
    /// afterwards.
    async fn stop(&mut self, error: Option<DispatchError>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Running,
    Stopped,
}

/// Lifecycle bookkeeping and the event bus, shared by every backend.
pub struct ExecutorCore {
    events: Arc<EventBus>,
    state: SessionState,
}

impl Default for ExecutorCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorCore {
    pub fn new() -> Self {
        Self {
            events: Arc::new(EventBus::default()),
            state: SessionState::Idle,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// A handle for tasks that publish from outside the executor.
    pub fn shared_events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Returns `Ok(true)` if this call started the session, `Ok(false)` if it
    /// was already running.
    pub fn start(&mut self) -> Result<bool> {
        match self.state {
            SessionState::Idle => {
                self.events.start();
                self.state = SessionState::Running;
                Ok(true)
            }
            SessionState::Running => Ok(false),
            SessionState::Stopped => Err(DispatchError::Stopped),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn ensure_running(&self) -> Result<()> {
        match self.state {
            SessionState::Running => Ok(()),
            SessionState::Idle => Err(DispatchError::NotStarted),
            SessionState::Stopped => Err(DispatchError::Stopped),
        }
    }

    pub fn publish(&self, status: JobStatus, job: &Job) {
        self.events.publish(status, job.clone());
    }

    /// Stop the event bus, then report the session error if there was one,
    /// otherwise the outcome of the backend's own cleanup.
    pub async fn finish(
        &mut self,
        error: Option<DispatchError>,
        cleanup: Result<()>,
    ) -> Result<()> {
        self.events.stop().await;
        self.state = SessionState::Stopped;
        match (error, cleanup) {
            (Some(error), Err(cleanup_error)) => {
                tracing::error!(error = %cleanup_error, "Cleanup failed after session error");
                Err(error)
            }
            (Some(error), Ok(())) => Err(error),
            (None, cleanup) => cleanup,
        }
    }
}

/// Run `body` inside a started session and always stop the executor.
///
/// A body error is passed to `stop` and returned once cleanup is done. A
/// panic in the body stops the executor with [`DispatchError::Panicked`] and
/// then resumes unwinding.
pub async fn run_session<T, F>(executor: &mut dyn Executor, body: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a mut dyn Executor) -> BoxFuture<'a, Result<T>>,
{
    executor.start().await?;

    let outcome = AssertUnwindSafe(body(&mut *executor)).catch_unwind().await;
    match outcome {
        Ok(Ok(value)) => {
            executor.stop(None).await?;
            Ok(value)
        }
        Ok(Err(error)) => Err(executor.stop(Some(error)).await.err().unwrap_or_else(|| {
            DispatchError::Internal("executor stop discarded the session error".to_string())
        })),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            if let Err(e) = executor.stop(Some(DispatchError::Panicked(message))).await {
                tracing::error!(error = %e, "Executor stopped after panic");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Reject a configuration variant meant for another backend.
pub(crate) fn mismatch(expected: ExecutorKind, found: ExecutorKind) -> DispatchError {
    DispatchError::ConfigMismatch { expected, found }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn core_lifecycle() {
        let mut core = ExecutorCore::new();
        assert!(matches!(core.ensure_running(), Err(DispatchError::NotStarted)));
        assert!(core.start().unwrap());
        assert!(!core.start().unwrap());
        core.ensure_running().unwrap();

        core.finish(None, Ok(())).await.unwrap();
        assert!(matches!(core.ensure_running(), Err(DispatchError::Stopped)));
        assert!(matches!(core.start(), Err(DispatchError::Stopped)));
    }

    #[tokio::test]
    async fn finish_prefers_session_error_over_cleanup_error() {
        let mut core = ExecutorCore::new();
        core.start().unwrap();
        let err = core
            .finish(
                Some(DispatchError::Internal("body".to_string())),
                Err(DispatchError::Internal("cleanup".to_string())),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "body");
    }

    #[tokio::test]
    async fn finish_reports_cleanup_error_on_clean_session() {
        let mut core = ExecutorCore::new();
        core.start().unwrap();
        let err = core
            .finish(None, Err(DispatchError::Internal("cleanup".to_string())))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cleanup");
    }

    #[test]
    fn kinds_have_distinct_names() {
        let names: std::collections::HashSet<String> =
            ExecutorKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names.len(), ExecutorKind::ALL.len());
    }
}
