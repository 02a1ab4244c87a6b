use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Error type a failing task reports. It is logged and forwarded to completion
/// handlers, never returned to the caller of the scheduler.
pub type TaskFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a single task body.
pub type TaskResult = Result<(), TaskFailure>;

/// An optional human-readable label, used in logs and completion notifications.
pub type TaskLabel = String;

/// The type of future an async task body is boxed into.
pub type TaskToExecute = Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>>;

pub(crate) type BlockingBody = Box<dyn FnOnce() -> TaskResult + Send + 'static>;

pub(crate) enum TaskBody {
  Async(TaskToExecute),
  Blocking(BlockingBody),
}

/// A zero-argument unit of work with no result value, executed at most once.
///
/// Async bodies run on the scheduler's Tokio runtime; blocking bodies run on
/// its blocking thread pool so they never stall the runtime workers.
pub struct Task {
  pub(crate) label: Option<TaskLabel>,
  pub(crate) body: TaskBody,
}

impl Task {
  pub fn from_future<F>(future: F) -> Self
  where
    F: Future<Output = TaskResult> + Send + 'static,
  {
    Self {
      label: None,
      body: TaskBody::Async(Box::pin(future)),
    }
  }

  pub fn blocking<F>(body: F) -> Self
  where
    F: FnOnce() -> TaskResult + Send + 'static,
  {
    Self {
      label: None,
      body: TaskBody::Blocking(Box::new(body)),
    }
  }

  pub fn with_label(mut self, label: impl Into<TaskLabel>) -> Self {
    self.label = Some(label.into());
    self
  }

  pub fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  pub fn is_blocking(&self) -> bool {
    matches!(self.body, TaskBody::Blocking(_))
  }
}

impl From<TaskToExecute> for Task {
  fn from(future: TaskToExecute) -> Self {
    Self {
      label: None,
      body: TaskBody::Async(future),
    }
  }
}

impl fmt::Debug for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("label", &self.label)
      .field("blocking", &self.is_blocking())
      .finish_non_exhaustive()
  }
}
