use async_trait::async_trait;

use crate::config::ExecutorConfig;
use crate::error::{DispatchError, Result};
use crate::events::EventBus;
use crate::executor::{mismatch, Executor, ExecutorCore, ExecutorKind};
use crate::scheduler::{Job, JobStatus};

/// Accepts jobs, publishes `Submitted`, and does nothing else.
#[derive(Default)]
pub struct NoopExecutor {
    core: ExecutorCore,
}

pub(crate) fn factory(config: ExecutorConfig) -> Result<Box<dyn Executor>> {
    match config {
        ExecutorConfig::Noop => Ok(Box::new(NoopExecutor::new())),
        other => Err(mismatch(ExecutorKind::Noop, other.kind())),
    }
}

impl NoopExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Executor for NoopExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Noop
    }

    fn events(&self) -> &EventBus {
        self.core.events()
    }

    async fn start(&mut self) -> Result<()> {
        self.core.start()?;
        Ok(())
    }

    async fn submit(&mut self, mut job: Job) -> Result<()> {
        self.core.ensure_running()?;
        job.mark_submitted()?;
        self.core.publish(JobStatus::Submitted, &job);
        Ok(())
    }

    async fn stop(&mut self, error: Option<DispatchError>) -> Result<()> {
        self.core.finish(error, Ok(())).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn publishes_submitted_only() {
        let mut executor = NoopExecutor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for status in [JobStatus::Submitted, JobStatus::Queued] {
            let seen = seen.clone();
            executor.events().subscribe(status, move |job| {
                seen.lock().unwrap().push((status, job.name.clone()));
                Ok(())
            });
        }

        executor.start().await.unwrap();
        executor.submit(Job::shell("dry", "rm -rf /")).await.unwrap();
        executor.stop(None).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(JobStatus::Submitted, "dry".to_string())]
        );
    }
}
