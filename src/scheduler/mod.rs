//! Job model and the HTTP scheduler service.
//!
//! - [`job`]: the [`Job`] record and its status transitions
//! - [`queue`]: the in-memory FIFO the service drains
//! - [`service`]: the axum router behind `/add_job`, `/get_job`, `/stop_server`
//! - [`client`]: the reqwest side used by remote executors and workers

pub mod client;
pub mod job;
pub mod queue;
pub mod service;

pub use client::SchedulerClient;
pub use job::{CommandSpec, Job, JobStatus, StderrTarget};
pub use queue::{JobQueue, PopError};
pub use service::{ServiceState, API_KEY_HEADER};
