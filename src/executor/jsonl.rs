use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::{ExecutorConfig, JsonLinesConfig};
use crate::error::{DispatchError, Result};
use crate::events::EventBus;
use crate::executor::{mismatch, Executor, ExecutorCore, ExecutorKind};
use crate::scheduler::{Job, JobStatus};

/// Writes each submitted job as one JSON line instead of running it.
///
/// The output file is created on `start` and must not already exist. Lines
/// are in the same format `add_job` accepts, so a dump can be replayed
/// against a scheduler service.
pub struct JsonLinesExecutor {
    config: JsonLinesConfig,
    core: ExecutorCore,
    output: Option<BufWriter<File>>,
}

pub(crate) fn factory(config: ExecutorConfig) -> Result<Box<dyn Executor>> {
    match config {
        ExecutorConfig::JsonLines(config) => Ok(Box::new(JsonLinesExecutor::new(config))),
        other => Err(mismatch(ExecutorKind::JsonLines, other.kind())),
    }
}

impl JsonLinesExecutor {
    pub fn new(config: JsonLinesConfig) -> Self {
        Self {
            config,
            core: ExecutorCore::new(),
            output: None,
        }
    }
}

#[async_trait]
impl Executor for JsonLinesExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::JsonLines
    }

    fn events(&self) -> &EventBus {
        self.core.events()
    }

    async fn start(&mut self) -> Result<()> {
        if !self.core.start()? {
            return Ok(());
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.config.output_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    DispatchError::ArtifactExists(self.config.output_path.clone())
                }
                _ => DispatchError::Io(e),
            })?;
        self.output = Some(BufWriter::new(file));
        Ok(())
    }

    async fn submit(&mut self, mut job: Job) -> Result<()> {
        self.core.ensure_running()?;
        let output = self.output.as_mut().ok_or(DispatchError::NotStarted)?;

        job.mark_submitted()?;
        let mut line = serde_json::to_string(&job)?;
        line.push('\n');
        output.write_all(line.as_bytes()).await?;

        self.core.publish(JobStatus::Submitted, &job);
        Ok(())
    }

    async fn stop(&mut self, error: Option<DispatchError>) -> Result<()> {
        let cleanup = match self.output.take() {
            Some(mut output) => output.flush().await.map_err(DispatchError::from),
            None => Ok(()),
        };
        self.core.finish(error, cleanup).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_submitted_job_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.jsonl");
        let mut executor = JsonLinesExecutor::new(JsonLinesConfig::new(&path));

        executor.start().await.unwrap();
        executor.submit(Job::shell("a", "echo a")).await.unwrap();
        executor.submit(Job::exec("b", ["echo", "b"])).await.unwrap();
        executor.stop(None).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let jobs: Vec<Job> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "a");
        assert_eq!(jobs[1].status, JobStatus::Submitted);
        assert!(jobs[1].submitted_time.is_some());
    }

    #[tokio::test]
    async fn refuses_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.jsonl");
        std::fs::write(&path, "keep\n").unwrap();

        let mut executor = JsonLinesExecutor::new(JsonLinesConfig::new(&path));
        let err = executor.start().await.unwrap_err();
        assert!(matches!(err, DispatchError::ArtifactExists(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep\n");
    }
}
