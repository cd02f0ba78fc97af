use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::Job;

/// Outcome of a pop attempt once the queue is stopping.
#[derive(Debug, PartialEq)]
pub enum PopError {
    /// The queue is stopping and holds no more jobs.
    Drained,
}

impl std::fmt::Display for PopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PopError::Drained => write!(f, "Queue is empty and the server is stopping"),
        }
    }
}

/// Process-wide FIFO of jobs waiting for a remote worker.
///
/// Pushes never block. Pops block until a job arrives, unless the queue has
/// been told to stop, in which case they drain what is left and then fail.
/// There is no depth limit and no expiry: a queued job waits until some
/// worker asks for it.
#[derive(Debug)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    // Poppers take turns on the receiver, which keeps delivery FIFO.
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
    stopping: CancellationToken,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            stopping: CancellationToken::new(),
        }
    }

    /// Append a job to the back of the queue.
    pub fn push(&self, job: Job) {
        // The receiver lives as long as self, so the send cannot fail.
        let _ = self.tx.send(job);
    }

    /// Remove the job at the front, waiting for one if the queue is empty.
    pub async fn pop(&self) -> Result<Job, PopError> {
        let mut rx = self.rx.lock().await;
        if self.stopping.is_cancelled() {
            return rx.try_recv().map_err(|_| PopError::Drained);
        }
        tokio::select! {
            biased;
            job = rx.recv() => job.ok_or(PopError::Drained),
            _ = self.stopping.cancelled() => rx.try_recv().map_err(|_| PopError::Drained),
        }
    }

    /// Switch to drain-then-fail mode and wake every blocked `pop`.
    pub fn stop(&self) {
        self.stopping.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pop_returns_jobs_in_push_order() {
        let queue = JobQueue::new();
        for name in ["a", "b", "c"] {
            queue.push(Job::shell(name, "true"));
        }
        for name in ["a", "b", "c"] {
            assert_eq!(queue.pop().await.unwrap().name, name);
        }
    }

    #[tokio::test]
    async fn stopped_empty_queue_fails_immediately() {
        let queue = JobQueue::new();
        queue.stop();
        let result = tokio::time::timeout(Duration::from_millis(100), queue.pop()).await;
        assert_eq!(result.unwrap().unwrap_err(), PopError::Drained);
    }

    #[tokio::test]
    async fn stopped_queue_still_drains() {
        let queue = JobQueue::new();
        queue.push(Job::shell("left", "true"));
        queue.stop();
        assert_eq!(queue.pop().await.unwrap().name, "left");
        assert!(queue.pop().await.is_err());
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let queue = Arc::new(JobQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!popper.is_finished());

        queue.push(Job::shell("late", "true"));
        let job = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.name, "late");
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_stop() {
        let queue = Arc::new(JobQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), PopError::Drained);
    }
}
