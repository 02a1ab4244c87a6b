use thiserror::Error;

/// Errors returned synchronously by the `worker_orchestra` scheduler.
///
/// Failures of the tasks themselves never surface here; they are caught at the
/// execution layer and reported through completion handlers instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
  #[error("Invalid concurrency bound {requested}: must be between 1 and {ceiling}")]
  Configuration { requested: usize, ceiling: usize },

  #[error("No task was supplied")]
  NullArgument,

  #[error("Scheduler has not been started")]
  NotStarted,

  #[error("Scheduler was already started; a scheduler instance runs a single lifecycle")]
  AlreadyStarted,

  #[error("Scheduler is draining or has finished, cannot accept new tasks")]
  ShuttingDown,
}
