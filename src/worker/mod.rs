//! Running jobs as local child processes.
//!
//! [`process`] builds and waits on the child for a [`Job`](crate::scheduler::Job);
//! the local executor and the remote [`WorkerLoop`] share it so redirection
//! behaves the same on both paths.

pub mod poll_loop;
pub mod process;

pub use poll_loop::{JobSource, WorkerLoop};
