use async_trait::async_trait;

use crate::config::{ExecutorConfig, RemoteConfig};
use crate::error::{DispatchError, Result};
use crate::events::EventBus;
use crate::executor::{mismatch, Executor, ExecutorCore, ExecutorKind};
use crate::scheduler::{Job, JobStatus, SchedulerClient};

/// Pushes jobs to a scheduler service for remote workers to pick up.
///
/// A `200` from `add_job` only means the job is on the service's queue; the
/// queue has no depth limit or expiry, so the job waits there until some
/// worker polls. Workers report completion in their own logs, so this
/// executor only ever publishes `Submitted`.
pub struct RemoteQueueExecutor {
    client: SchedulerClient,
    core: ExecutorCore,
}

pub(crate) fn factory(config: ExecutorConfig) -> Result<Box<dyn Executor>> {
    match config {
        ExecutorConfig::Remote(config) => Ok(Box::new(RemoteQueueExecutor::new(&config)?)),
        other => Err(mismatch(ExecutorKind::Remote, other.kind())),
    }
}

impl RemoteQueueExecutor {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        Ok(Self {
            client: SchedulerClient::new(config)?,
            core: ExecutorCore::new(),
        })
    }
}

#[async_trait]
impl Executor for RemoteQueueExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Remote
    }

    fn events(&self) -> &EventBus {
        self.core.events()
    }

    async fn start(&mut self) -> Result<()> {
        if self.core.start()? {
            tracing::info!(scheduler = %self.client.base_url(), "Remote queue executor started");
        }
        Ok(())
    }

    async fn submit(&mut self, mut job: Job) -> Result<()> {
        self.core.ensure_running()?;
        job.mark_submitted()?;
        self.client.add_job(&job).await?;
        tracing::debug!(job = %job.name, "Job accepted by scheduler");
        self.core.publish(JobStatus::Submitted, &job);
        Ok(())
    }

    async fn stop(&mut self, error: Option<DispatchError>) -> Result<()> {
        let cleanup = if self.core.is_running() {
            self.client.stop_server().await
        } else {
            Ok(())
        };
        self.core.finish(error, cleanup).await
    }
}
