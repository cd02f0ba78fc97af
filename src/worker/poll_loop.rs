use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{DispatchError, Result};
use crate::scheduler::{Job, SchedulerClient};
use crate::worker::process;

/// Where a worker gets its next job from.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn next_job(&self) -> Result<Job>;
}

#[async_trait]
impl JobSource for SchedulerClient {
    async fn next_job(&self) -> Result<Job> {
        self.get_job().await
    }
}

/// Long-polls a [`JobSource`] and runs each job to completion locally.
///
/// Every failed cycle (fetch error, malformed job, launch failure) bumps a
/// counter and any completed job resets it. After `max_retries`
/// consecutive failures the loop gives up with
/// [`DispatchError::RetriesExhausted`]. A job that exits non-zero still
/// counts as a completed cycle.
///
/// Shutdown is only observed while waiting for work; a running job is never
/// interrupted.
pub struct WorkerLoop<S> {
    source: S,
    max_retries: u32,
    shutdown: CancellationToken,
}

impl WorkerLoop<SchedulerClient> {
    pub fn from_config(config: &WorkerConfig, shutdown: CancellationToken) -> Result<Self> {
        let client = SchedulerClient::new(&config.remote)?;
        Ok(Self::new(client, config.max_retries, shutdown))
    }
}

impl<S: JobSource> WorkerLoop<S> {
    pub fn new(source: S, max_retries: u32, shutdown: CancellationToken) -> Self {
        Self {
            source,
            max_retries: max_retries.max(1),
            shutdown,
        }
    }

    /// Run until shutdown or retry exhaustion. Returns the number of jobs
    /// that ran to completion.
    pub async fn run(&self) -> Result<u64> {
        let mut completed = 0u64;
        let mut failures = 0u32;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(completed, "Worker shutting down");
                    return Ok(completed);
                }
                fetched = self.source.next_job() => fetched,
            };

            let outcome = match fetched {
                Ok(mut job) => process::run(&mut job).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    completed += 1;
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(
                        error = %e,
                        attempt = failures,
                        max_retries = self.max_retries,
                        "Worker cycle failed"
                    );
                    if failures >= self.max_retries {
                        return Err(DispatchError::RetriesExhausted {
                            attempts: failures,
                            last: Box::new(e),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Replays a fixed script of fetch outcomes, then fails forever.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Job>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Job>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobSource for ScriptedSource {
        async fn next_job(&self) -> Result<Job> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(DispatchError::Internal("script exhausted".into())))
        }
    }

    fn queued(name: &str, line: &str) -> Result<Job> {
        let mut job = Job::shell(name, line);
        job.mark_submitted()?;
        job.mark_queued()?;
        Ok(job)
    }

    fn fetch_error() -> Result<Job> {
        Err(DispatchError::Internal("connection refused".into()))
    }

    #[tokio::test]
    async fn three_consecutive_failures_terminate() {
        let source = ScriptedSource::new(vec![fetch_error(), fetch_error(), fetch_error()]);
        let worker = WorkerLoop::new(source, 3, CancellationToken::new());

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, DispatchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(worker.source.calls(), 3);
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let source = ScriptedSource::new(vec![
            fetch_error(),
            fetch_error(),
            queued("ok", "true"),
            fetch_error(),
            fetch_error(),
            fetch_error(),
        ]);
        let worker = WorkerLoop::new(source, 3, CancellationToken::new());

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, DispatchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(worker.source.calls(), 6);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_completed_cycle() {
        let source = ScriptedSource::new(vec![
            fetch_error(),
            fetch_error(),
            queued("fails", "exit 7"),
            fetch_error(),
            fetch_error(),
        ]);
        let worker = WorkerLoop::new(source, 3, CancellationToken::new());

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, DispatchError::RetriesExhausted { .. }));
        assert_eq!(worker.source.calls(), 6);
    }

    #[tokio::test]
    async fn launch_failure_counts_as_a_failure() {
        let mut missing = Job::exec("missing", ["/definitely/not/a/binary"]);
        missing.mark_submitted().unwrap();
        missing.mark_queued().unwrap();

        let source = ScriptedSource::new(vec![Ok(missing), fetch_error(), fetch_error()]);
        let worker = WorkerLoop::new(source, 3, CancellationToken::new());

        let err = worker.run().await.unwrap_err();
        match err {
            DispatchError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(worker.source.calls(), 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_fetching() {
        let source = ScriptedSource::new(vec![queued("never", "true")]);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let worker = WorkerLoop::new(source, 3, shutdown);

        assert_eq!(worker.run().await.unwrap(), 0);
        assert_eq!(worker.source.calls(), 0);
    }
}
