pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{DispatchError, Result};
