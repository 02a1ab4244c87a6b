use crate::task::Task;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Bookkeeping kept for every task currently in the running set.
#[derive(Debug, Clone)]
pub(crate) struct RunningTaskInfo {
  pub(crate) label: Option<Arc<str>>,
  pub(crate) admitted_at: Instant,
}

/// Membership of one task in the running set, together with the concurrency
/// permit it was admitted under.
///
/// Dropping the guard removes the running-set entry first and only then gives
/// the permit back, so a new admission can never observe more than
/// `max_concurrent` live entries. It runs on every exit path of an execution,
/// including panics and the runtime dropping the future.
pub(crate) struct RunningGuard {
  task_id: u64,
  running: Arc<DashMap<u64, RunningTaskInfo>>,
  activity: Arc<watch::Sender<u64>>,
  permit: Option<OwnedSemaphorePermit>,
}

impl RunningGuard {
  pub(crate) fn task_id(&self) -> u64 {
    self.task_id
  }

  /// Time spent in the running set so far.
  pub(crate) fn elapsed(&self) -> Duration {
    self
      .running
      .get(&self.task_id)
      .map(|entry| entry.admitted_at.elapsed())
      .unwrap_or_default()
  }
}

impl fmt::Debug for RunningGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunningGuard")
      .field("task_id", &self.task_id)
      .field("holds_permit", &self.permit.is_some())
      .finish_non_exhaustive()
  }
}

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.running.remove(&self.task_id);
    drop(self.permit.take());
    signal(&self.activity);
  }
}

/// A task that has just moved from the pending queue into the running set.
pub(crate) struct AdmittedTask {
  pub(crate) task: Task,
  pub(crate) guard: RunningGuard,
}

/// The pending FIFO and the running set of a scheduler.
///
/// Both halves are only ever moved between while the pending lock is held, so
/// `is_idle()` and the counters never see a task in transit.
pub(crate) struct WorkQueue {
  pending: Mutex<VecDeque<Task>>,
  running: Arc<DashMap<u64, RunningTaskInfo>>,
  activity: Arc<watch::Sender<u64>>,
}

impl fmt::Debug for WorkQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkQueue")
      .field("pending", &self.pending_count())
      .field("running", &self.running_count())
      .finish_non_exhaustive()
  }
}

fn signal(activity: &watch::Sender<u64>) {
  activity.send_modify(|generation| *generation = generation.wrapping_add(1));
}

impl WorkQueue {
  pub(crate) fn new() -> Self {
    let (activity, _) = watch::channel(0u64);
    Self {
      pending: Mutex::new(VecDeque::new()),
      running: Arc::new(DashMap::new()),
      activity: Arc::new(activity),
    }
  }

  /// A receiver that observes every enqueue, clear and completion.
  pub(crate) fn subscribe_activity(&self) -> watch::Receiver<u64> {
    self.activity.subscribe()
  }

  #[cfg(test)]
  pub(crate) fn enqueue(&self, task: Task) {
    self.pending.lock().push_back(task);
    signal(&self.activity);
  }

  /// Appends `task` only if `accept` holds. `accept` is evaluated under the
  /// pending lock, so it cannot interleave with `when_idle`. Returns whether
  /// the task was queued; a rejected task is dropped.
  pub(crate) fn enqueue_if<F>(&self, task: Task, accept: F) -> bool
  where
    F: FnOnce() -> bool,
  {
    let mut pending = self.pending.lock();
    if !accept() {
      return false;
    }
    pending.push_back(task);
    drop(pending);
    signal(&self.activity);
    true
  }

  /// Runs `f` while holding the pending lock. Nothing can be queued, admitted
  /// or found idle until it returns.
  pub(crate) fn exclusive<R, F>(&self, f: F) -> R
  where
    F: FnOnce() -> R,
  {
    let _pending = self.pending.lock();
    f()
  }

  /// Moves the head of the pending queue into the running set under a fresh
  /// id. `may_admit` is checked under the pending lock, so a task is never
  /// admitted after a concurrent `exclusive` call turned it off. Returns
  /// `None`, releasing the permit, when nothing is pending or admission is
  /// off.
  pub(crate) fn admit_next<F>(&self, permit: OwnedSemaphorePermit, may_admit: F) -> Option<AdmittedTask>
  where
    F: FnOnce() -> bool,
  {
    let mut pending = self.pending.lock();
    if !may_admit() {
      return None;
    }
    let task = pending.pop_front()?;
    let task_id = NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    self.running.insert(
      task_id,
      RunningTaskInfo {
        label: task.label.as_deref().map(Arc::from),
        admitted_at: Instant::now(),
      },
    );
    drop(pending);

    Some(AdmittedTask {
      task,
      guard: RunningGuard {
        task_id,
        running: self.running.clone(),
        activity: self.activity.clone(),
        permit: Some(permit),
      },
    })
  }

  /// Discards every pending task and returns how many were dropped. Running
  /// tasks are untouched.
  pub(crate) fn clear(&self) -> usize {
    let discarded: Vec<Task> = self.pending.lock().drain(..).collect();
    let count = discarded.len();
    // Task bodies may own arbitrary resources; drop them outside the lock.
    drop(discarded);
    signal(&self.activity);
    count
  }

  pub(crate) fn pending_count(&self) -> usize {
    self.pending.lock().len()
  }

  pub(crate) fn running_count(&self) -> usize {
    self.running.len()
  }

  #[cfg(test)]
  pub(crate) fn is_idle(&self) -> bool {
    let pending = self.pending.lock();
    pending.is_empty() && self.running.is_empty()
  }

  /// Runs `on_idle` while holding the pending lock if both the queue and the
  /// running set are empty. Returns `on_idle`'s result, or `false`.
  pub(crate) fn when_idle<F>(&self, on_idle: F) -> bool
  where
    F: FnOnce() -> bool,
  {
    let pending = self.pending.lock();
    if pending.is_empty() && self.running.is_empty() {
      on_idle()
    } else {
      false
    }
  }

  /// Runs `on_drained` with the pending count, under the pending lock, if the
  /// running set is empty. Returns `None` when tasks are still running.
  pub(crate) fn when_drained<R, F>(&self, on_drained: F) -> Option<R>
  where
    F: FnOnce(usize) -> R,
  {
    let pending = self.pending.lock();
    if self.running.is_empty() {
      Some(on_drained(pending.len()))
    } else {
      None
    }
  }

  pub(crate) fn running_labels(&self) -> Vec<(u64, Option<Arc<str>>)> {
    self
      .running
      .iter()
      .map(|entry| (*entry.key(), entry.value().label.clone()))
      .collect()
  }
}
