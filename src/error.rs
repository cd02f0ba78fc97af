use std::path::PathBuf;

use thiserror::Error;

use crate::executor::ExecutorKind;
use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job {job}: failed to launch process: {source}")]
    Spawn {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {job}: failed waiting for process: {source}")]
    Wait {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {job}: invalid command: {reason}")]
    InvalidCommand { job: String, reason: String },

    #[error("Job {job}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Transport error{}: {source}", job_suffix(.job))]
    Transport {
        job: Option<String>,
        #[source]
        source: reqwest::Error,
    },

    #[error("Scheduler returned HTTP {status}{}: {message}", job_suffix(.job))]
    Rejected {
        job: Option<String>,
        status: u16,
        message: String,
    },

    #[error("Refusing to overwrite existing file {0}")]
    ArtifactExists(PathBuf),

    #[error("No executor registered for {0}")]
    Unregistered(ExecutorKind),

    #[error("Executor {expected} cannot be built from {found} configuration")]
    ConfigMismatch {
        expected: ExecutorKind,
        found: ExecutorKind,
    },

    #[error("Executor has not been started")]
    NotStarted,

    #[error("Executor has already been stopped")]
    Stopped,

    #[error("Session panicked: {0}")]
    Panicked(String),

    #[error("Worker gave up after {attempts} consecutive failures: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DispatchError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

fn job_suffix(job: &Option<String>) -> String {
    match job {
        Some(name) => format!(" for job {}", name),
        None => String::new(),
    }
}

impl DispatchError {
    pub fn transport(job: Option<&str>, source: reqwest::Error) -> Self {
        DispatchError::Transport {
            job: job.map(str::to_string),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
