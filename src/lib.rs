//! A Tokio-based bounded-concurrency task scheduler: FIFO admission of queued
//! tasks under a concurrency limit, observable pending/running counts, and a
//! graceful shutdown whose worst-case wait is bounded by a grace timeout.

mod config;
mod error;
mod notifier;
mod scheduler;
mod state;
mod task;
mod task_queue;

pub use config::{SchedulerConfig, DEFAULT_GRACE_TIMEOUT, DEFAULT_REFRESH_INTERVAL, MAX_CONCURRENCY_CEILING};
pub use error::SchedulerError;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use scheduler::Scheduler;
pub use state::{Completion, LifecycleState};
pub use task::{Task, TaskFailure, TaskLabel, TaskResult, TaskToExecute};
