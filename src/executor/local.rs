use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{ExecutorConfig, LocalConfig};
use crate::error::{DispatchError, Result};
use crate::events::EventBus;
use crate::executor::{mismatch, Executor, ExecutorCore, ExecutorKind};
use crate::scheduler::{Job, JobStatus};
use crate::worker::process;

/// Runs jobs as child processes, at most `max_workers` at a time.
///
/// `submit` never waits for a free slot: the job is queued on the pool and
/// picked up as soon as a slot opens. Each job publishes
/// `Submitted, Queued, Started, Completed`, or `Cancelled` in place of the
/// last two if its process cannot be launched.
pub struct LocalExecutor {
    config: LocalConfig,
    core: ExecutorCore,
    slots: Arc<Semaphore>,
    tasks: JoinSet<Result<()>>,
}

pub(crate) fn factory(config: ExecutorConfig) -> Result<Box<dyn Executor>> {
    match config {
        ExecutorConfig::Local(config) => Ok(Box::new(LocalExecutor::new(config))),
        other => Err(mismatch(ExecutorKind::Local, other.kind())),
    }
}

impl LocalExecutor {
    pub fn new(config: LocalConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            core: ExecutorCore::new(),
            slots,
            tasks: JoinSet::new(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Jobs handed to the pool and not yet reaped by `stop`.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

async fn run_job(mut job: Job, slots: Arc<Semaphore>, events: Arc<EventBus>) -> Result<()> {
    let _permit = slots
        .acquire_owned()
        .await
        .map_err(|_| DispatchError::Internal("worker pool closed".to_string()))?;

    let child = match process::launch(&mut job) {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(job = %job.name, error = %e, "Job could not be launched");
            job.mark_cancelled()?;
            events.publish(JobStatus::Cancelled, job);
            return Err(e);
        }
    };
    events.publish(JobStatus::Started, job.clone());

    let waited = process::wait(&mut job, child).await;
    if job.status.is_terminal() {
        events.publish(JobStatus::Completed, job);
    }
    waited
}

#[async_trait]
impl Executor for LocalExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    fn events(&self) -> &EventBus {
        self.core.events()
    }

    async fn start(&mut self) -> Result<()> {
        if self.core.start()? {
            tracing::info!(max_workers = self.config.max_workers, "Local executor started");
        }
        Ok(())
    }

    async fn submit(&mut self, mut job: Job) -> Result<()> {
        self.core.ensure_running()?;

        job.mark_submitted()?;
        self.core.publish(JobStatus::Submitted, &job);
        job.mark_queued()?;
        self.core.publish(JobStatus::Queued, &job);

        tracing::debug!(job = %job.name, "Job queued on local pool");
        self.tasks
            .spawn(run_job(job, self.slots.clone(), self.core.shared_events()));
        Ok(())
    }

    async fn stop(&mut self, error: Option<DispatchError>) -> Result<()> {
        let mut failed = 0usize;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(error = %e, "Job failed");
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(error = %e, "Job task aborted");
                }
            }
        }
        if failed > 0 {
            tracing::warn!(failed, "Local executor finished with failed jobs");
        }
        self.slots.close();
        self.core.finish(error, Ok(())).await
    }
}
