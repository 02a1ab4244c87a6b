use crate::error::SchedulerError;

use std::time::Duration;

/// Hard ceiling on the number of live execution slots a scheduler may be
/// started with.
pub const MAX_CONCURRENCY_CEILING: usize = 1020;

/// Default polling period of the dispatch loop and the completion monitor.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(5);

/// Default wait applied by `stop()` before abandoning never-admitted work.
pub const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Tunables for a [`Scheduler`](crate::Scheduler).
///
/// The concurrency bound is not part of the config; it is supplied to
/// `start()` and validated there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
  pub name: String,
  /// Upper bound on how long the background loops sleep between checks when
  /// no activity is signalled.
  pub refresh_interval: Duration,
  /// How long `stop()` waits, once running work has drained, before it
  /// finishes the scheduler while tasks are still queued.
  pub grace_timeout: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      name: "scheduler".to_string(),
      refresh_interval: DEFAULT_REFRESH_INTERVAL,
      grace_timeout: DEFAULT_GRACE_TIMEOUT,
    }
  }
}

impl SchedulerConfig {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  /// Zero is bumped to one millisecond so the loops never spin.
  pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
    self.refresh_interval = refresh_interval.max(Duration::from_millis(1));
    self
  }

  pub fn with_grace_timeout(mut self, grace_timeout: Duration) -> Self {
    self.grace_timeout = grace_timeout;
    self
  }
}

/// Checks a requested concurrency bound against `1..=MAX_CONCURRENCY_CEILING`.
pub(crate) fn validate_max_concurrent(requested: usize) -> Result<usize, SchedulerError> {
  if requested == 0 || requested > MAX_CONCURRENCY_CEILING {
    return Err(SchedulerError::Configuration {
      requested,
      ceiling: MAX_CONCURRENCY_CEILING,
    });
  }
  Ok(requested)
}
