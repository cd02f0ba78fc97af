//! In-process publish/subscribe for job status transitions.
//!
//! Executors publish `(status, job)` pairs into an unbounded channel, so a
//! slow subscriber never holds up `submit`. A single
//! consumer running on a dedicated blocking thread pulls them off in publish
//! order and invokes every callback subscribed to that status, in
//! registration order. Callbacks are plain synchronous closures, so they may
//! write to files or the log without holding up the async runtime.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scheduler::{Job, JobStatus};

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&Job) -> Result<(), CallbackError> + Send + Sync>;
type Event = (JobStatus, Job);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct EventBus {
    sender: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    subscriptions: Arc<RwLock<Vec<(JobStatus, Callback)>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            consumer: Mutex::new(None),
        }
    }

    /// Run `callback` for every future event with the given status.
    ///
    /// Safe to call before or after [`start`](Self::start).
    pub fn subscribe<F>(&self, status: JobStatus, callback: F)
    where
        F: Fn(&Job) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((status, Arc::new(callback)));
    }

    /// Enqueue an event without waiting on subscribers.
    ///
    /// Events published after [`stop`](Self::stop) are dropped with a warning.
    pub fn publish(&self, status: JobStatus, job: Job) {
        let guard = locked(&self.sender);
        let Some(sender) = guard.as_ref() else {
            tracing::warn!(job = %job.name, status = %status, "Event bus stopped, event dropped");
            return;
        };
        if sender.send((status, job)).is_err() {
            tracing::warn!(status = %status, "Event consumer gone, event dropped");
        }
    }

    /// Launch the consumer. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(mut rx) = locked(&self.receiver).take() else {
            return;
        };
        let subscriptions = self.subscriptions.clone();
        let handle = tokio::task::spawn_blocking(move || {
            while let Some((status, job)) = rx.blocking_recv() {
                dispatch(&subscriptions, status, &job);
            }
            tracing::debug!("Event consumer drained");
        });
        *locked(&self.consumer) = Some(handle);
    }

    /// Close the channel, deliver everything already queued, then wait for
    /// the consumer to exit.
    pub async fn stop(&self) {
        // Starting here lets events published before start still be delivered.
        self.start();
        drop(locked(&self.sender).take());

        let handle = locked(&self.consumer).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Event consumer terminated abnormally");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(subscriptions: &RwLock<Vec<(JobStatus, Callback)>>, status: JobStatus, job: &Job) {
    let callbacks: Vec<Callback> = subscriptions
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|(s, _)| *s == status)
        .map(|(_, cb)| cb.clone())
        .collect();

    for callback in callbacks {
        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(job))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(job = %job.name, status = %status, error = %e, "Event callback failed");
            }
            Err(_) => {
                tracing::error!(job = %job.name, status = %status, "Event callback panicked");
            }
        }
    }
}
