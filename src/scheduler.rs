use crate::config::{validate_max_concurrent, SchedulerConfig};
use crate::error::SchedulerError;
use crate::notifier::{CompletionNotifier, TaskCompletionInfo, TaskCompletionStatus};
use crate::state::{Completion, LifecycleState, StateCell};
use crate::task::{Task, TaskBody};
use crate::task_queue::{AdmittedTask, WorkQueue};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// State shared between the public handle and the background loops.
struct SchedulerCore {
  name: Arc<String>,
  config: SchedulerConfig,
  work: WorkQueue,
  state: StateCell,
  /// Starts with no permits; `start()` adds `max_concurrent` of them.
  semaphore: Arc<Semaphore>,
  max_concurrent: AtomicUsize,
  notifier: CompletionNotifier,
  tokio_handle: TokioHandle,
  /// Cancelled when the last `Scheduler` handle is dropped.
  closed_token: CancellationToken,
  /// Child of `closed_token`; cancelled by `stop()`. Once cancelled the
  /// scheduler never admits or accepts work again.
  dispatch_token: CancellationToken,
}

/// A bounded-concurrency FIFO task scheduler running on a Tokio runtime.
///
/// Tasks are queued with [`add`](Scheduler::add) and admitted in submission
/// order, at most `max_concurrent` at a time, once [`start`](Scheduler::start)
/// has been called. [`stop`](Scheduler::stop) stops admission and lets running
/// tasks finish; work that was never admitted is given one grace timeout and
/// then abandoned. [`join`](Scheduler::join) resolves when the scheduler has
/// finished, either because everything ran or because the grace timeout
/// expired.
///
/// Running out of work without a `stop()` is not final: the scheduler reports
/// `Finished` and goes back to `Running` as soon as another task is added.
/// `start()` is accepted once; after `stop()` no task is accepted again.
pub struct Scheduler {
  core: Arc<SchedulerCore>,
}

impl std::fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Scheduler")
      .field("name", &self.core.name)
      .field("state", &self.core.state.get())
      .field("work", &self.core.work)
      .field("notifier", &self.core.notifier)
      .finish_non_exhaustive()
  }
}

impl Scheduler {
  pub fn new(config: SchedulerConfig, tokio_handle: TokioHandle) -> Arc<Self> {
    let name = Arc::new(config.name.clone());
    let closed_token = CancellationToken::new();
    let dispatch_token = closed_token.child_token();

    debug!(scheduler = %name, ?config, "Creating scheduler.");
    Arc::new(Self {
      core: Arc::new(SchedulerCore {
        name: name.clone(),
        config,
        work: WorkQueue::new(),
        state: StateCell::new(),
        semaphore: Arc::new(Semaphore::new(0)),
        max_concurrent: AtomicUsize::new(0),
        notifier: CompletionNotifier::new(tokio_handle.clone(), name),
        tokio_handle,
        closed_token,
        dispatch_token,
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.core.name
  }

  pub fn config(&self) -> &SchedulerConfig {
    &self.core.config
  }

  /// The bound passed to `start()`, or `0` before that.
  pub fn max_concurrent(&self) -> usize {
    self.core.max_concurrent.load(AtomicOrdering::Acquire)
  }

  pub fn state(&self) -> LifecycleState {
    self.core.state.get()
  }

  /// Number of queued, not yet admitted tasks. Advisory.
  pub fn pending_count(&self) -> usize {
    self.core.work.pending_count()
  }

  /// Number of tasks currently executing. Advisory.
  pub fn running_count(&self) -> usize {
    self.core.work.running_count()
  }

  /// Appends a task to the pending queue. Never blocks.
  ///
  /// Adding to a scheduler that finished because it ran out of work moves it
  /// back to `Running`.
  ///
  /// # Errors
  /// `NullArgument` if `task` is `None`; `ShuttingDown` once `stop()` was
  /// called. The queue is unchanged in both cases.
  pub fn add(&self, task: impl Into<Option<Task>>) -> Result<(), SchedulerError> {
    let task = task.into().ok_or_else(|| {
      warn!(scheduler = %self.core.name, "Add: No task supplied.");
      SchedulerError::NullArgument
    })?;

    trace!(scheduler = %self.core.name, label = ?task.label(), "Queueing task.");
    let mut state = LifecycleState::Idle;
    let accepted = self.core.work.enqueue_if(task, || {
      state = self.core.state.get();
      match state {
        LifecycleState::Idle | LifecycleState::Running => true,
        LifecycleState::Finished(_) if !self.core.dispatch_token.is_cancelled() => {
          self.core.rearm();
          true
        }
        _ => false,
      }
    });
    if !accepted {
      warn!(scheduler = %self.core.name, %state, "Add: Attempted to add a task to a scheduler that is no longer admitting.");
      return Err(SchedulerError::ShuttingDown);
    }
    Ok(())
  }

  /// Discards every pending task; running tasks are unaffected. Returns the
  /// number of tasks discarded.
  pub fn clear(&self) -> usize {
    let discarded = self.core.work.clear();
    info!(scheduler = %self.core.name, discarded, "Cleared pending queue.");
    discarded
  }

  /// Registers a handler invoked once for every executed task, with its
  /// outcome. This is how task failures are observed: they are never returned
  /// from any scheduler call.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.core.notifier.add_handler(handler);
  }

  /// Starts admitting tasks, at most `max_concurrent` at a time.
  ///
  /// Tasks already queued are admitted before this returns. The completion
  /// monitor starts alongside the dispatch loop, so starting with an empty
  /// queue reports `Finished` until the next `add()`.
  ///
  /// # Errors
  /// `Configuration` if `max_concurrent` is `0` or exceeds
  /// [`MAX_CONCURRENCY_CEILING`](crate::MAX_CONCURRENCY_CEILING);
  /// `AlreadyStarted` on any call after the first successful one.
  pub fn start(&self, max_concurrent: usize) -> Result<(), SchedulerError> {
    let max_concurrent = validate_max_concurrent(max_concurrent).map_err(|e| {
      error!(scheduler = %self.core.name, "Start: {}", e);
      e
    })?;

    let (previous, changed) = self.core.state.transition(|state| match state {
      LifecycleState::Idle => Some(LifecycleState::Running),
      _ => None,
    });
    if !changed {
      warn!(scheduler = %self.core.name, state = %previous, "Start: Scheduler already started.");
      return Err(SchedulerError::AlreadyStarted);
    }

    self.core.max_concurrent.store(max_concurrent, AtomicOrdering::Release);
    self.core.semaphore.add_permits(max_concurrent);
    info!(
      scheduler = %self.core.name,
      max_concurrent,
      pending = self.core.work.pending_count(),
      "Scheduler started."
    );

    let admitted = self.core.admit_available();
    debug!(scheduler = %self.core.name, admitted, "Initial dispatch pass complete.");

    self.core.tokio_handle.spawn(
      self
        .core
        .clone()
        .run_dispatch_loop()
        .instrument(info_span!("dispatch_loop", scheduler = %*self.core.name)),
    );
    self.core.tokio_handle.spawn(
      self
        .core
        .clone()
        .run_completion_monitor()
        .instrument(info_span!("completion_monitor", scheduler = %*self.core.name)),
    );
    Ok(())
  }

  /// Stops admission and begins a graceful, possibly lossy, drain. Returns
  /// immediately; use [`join`](Scheduler::join) to wait for the outcome.
  ///
  /// Running tasks always run to completion. If tasks are still queued once
  /// they have, the scheduler waits one grace timeout and then finishes
  /// without running them. Stopping a scheduler that already ran out of work
  /// makes that finish final. Calling `stop()` again is a no-op.
  ///
  /// # Errors
  /// `NotStarted` if `start()` was never called.
  pub fn stop(&self) -> Result<(), SchedulerError> {
    // Under the pending lock, so no admission or re-arming `add` interleaves.
    let (previous, already_stopped) = self.core.work.exclusive(|| {
      let already_stopped = self.core.dispatch_token.is_cancelled();
      let (previous, _) = self.core.state.transition(|state| match state {
        LifecycleState::Running => Some(LifecycleState::Draining),
        _ => None,
      });
      if previous != LifecycleState::Idle {
        self.core.dispatch_token.cancel();
      }
      (previous, already_stopped)
    });

    match previous {
      LifecycleState::Idle => {
        warn!(scheduler = %self.core.name, "Stop: Scheduler was never started.");
        Err(SchedulerError::NotStarted)
      }
      _ if already_stopped => {
        debug!(scheduler = %self.core.name, state = %previous, "Stop: Shutdown already in progress or completed.");
        Ok(())
      }
      LifecycleState::Finished(_) => {
        info!(scheduler = %self.core.name, "Stopping idle scheduler: no work left, finish is now final.");
        self.core.notifier.close();
        Ok(())
      }
      _ => {
        info!(
          scheduler = %self.core.name,
          running = self.core.work.running_count(),
          pending = self.core.work.pending_count(),
          "Stopping scheduler: admission halted, draining running tasks."
        );
        self.core.tokio_handle.spawn(
          self
            .core
            .clone()
            .run_shutdown_controller()
            .instrument(info_span!("shutdown_controller", scheduler = %*self.core.name)),
        );
        Ok(())
      }
    }
  }

  /// Waits until the scheduler has finished and returns how it finished.
  ///
  /// All completion handlers have been invoked for every executed task by the
  /// time this resolves. May be awaited from several places at once; every
  /// caller waits for the handlers.
  ///
  /// # Errors
  /// `NotStarted` if `start()` was never called.
  pub async fn join(&self) -> Result<Completion, SchedulerError> {
    if self.core.state.get() == LifecycleState::Idle {
      warn!(scheduler = %self.core.name, "Join: Scheduler was never started.");
      return Err(SchedulerError::NotStarted);
    }

    let completion = self.core.state.wait_finished().await;
    self.core.notifier.await_delivered().await;

    debug!(scheduler = %self.core.name, ?completion, "Join: Scheduler finished.");
    Ok(completion)
  }
}

impl SchedulerCore {
  /// Admits as many pending tasks as there are free permits, in FIFO order.
  fn admit_available(self: &Arc<Self>) -> usize {
    let mut admitted = 0;
    while self.state.get().is_admitting() && self.work.pending_count() > 0 {
      let permit = match self.semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => break,
      };
      match self.work.admit_next(permit, || self.state.get().is_admitting()) {
        Some(task) => {
          self.spawn_execution(task);
          admitted += 1;
        }
        None => break,
      }
    }
    admitted
  }

  fn spawn_execution(self: &Arc<Self>, admitted: AdmittedTask) {
    let AdmittedTask { task, guard } = admitted;
    let task_id = guard.task_id();
    let label: Option<Arc<str>> = task.label.as_deref().map(Arc::from);
    debug!(scheduler = %self.name, %task_id, ?label, "Admitted task.");

    let core = self.clone();
    let span = info_span!("managed_task", scheduler = %*self.name, %task_id);
    self.tokio_handle.spawn(
      async move {
        let status = core.execute(task).await;
        let elapsed = guard.elapsed();
        core
          .notifier
          .notify(TaskCompletionInfo {
            task_id,
            scheduler_name: core.name.clone(),
            label,
            status,
            elapsed,
            completion_time: SystemTime::now(),
          })
          .await;
        // Leaves the running set and frees the slot.
        drop(guard);
      }
      .instrument(span),
    );
  }

  async fn execute(&self, task: Task) -> TaskCompletionStatus {
    let status = match task.body {
      TaskBody::Async(future) => match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => TaskCompletionStatus::Succeeded,
        Ok(Err(failure)) => TaskCompletionStatus::Failed(failure.to_string()),
        Err(_panic_payload) => TaskCompletionStatus::Panicked,
      },
      TaskBody::Blocking(body) => match self.tokio_handle.spawn_blocking(body).await {
        Ok(Ok(())) => TaskCompletionStatus::Succeeded,
        Ok(Err(failure)) => TaskCompletionStatus::Failed(failure.to_string()),
        Err(join_error) if join_error.is_panic() => TaskCompletionStatus::Panicked,
        Err(join_error) => TaskCompletionStatus::Failed(format!("blocking task did not complete: {}", join_error)),
      },
    };

    match &status {
      TaskCompletionStatus::Succeeded => trace!("Task executed successfully."),
      TaskCompletionStatus::Failed(reason) => warn!(%reason, "Task failed."),
      TaskCompletionStatus::Panicked => error!("Task panicked during execution."),
    }
    status
  }

  /// Raises `finished`. Only the first caller wins. The finish is final once
  /// `stop()` was called; before that the next `add()` re-arms the scheduler.
  fn finish(&self, completion: Completion) -> bool {
    if !self.state.finish(completion) {
      return false;
    }
    let is_final = self.dispatch_token.is_cancelled();
    if completion.forced {
      warn!(
        scheduler = %self.name,
        abandoned = completion.abandoned,
        "Scheduler finished after grace timeout; queued tasks were abandoned."
      );
    } else if is_final {
      info!(scheduler = %self.name, "Scheduler finished: queue and running set are empty.");
    } else {
      debug!(scheduler = %self.name, "Scheduler ran out of work; waiting for more.");
    }
    if is_final {
      self.notifier.close();
    }
    true
  }

  /// Finished -> Running. Called by `add` under the pending lock.
  fn rearm(&self) {
    let (previous, changed) = self.state.transition(|state| match state {
      LifecycleState::Finished(completion) if completion.is_lossless() => Some(LifecycleState::Running),
      _ => None,
    });
    if changed {
      debug!(scheduler = %self.name, state = %previous, "New work added. Scheduler running again.");
    }
  }

  fn finish_if_idle(&self) -> bool {
    self.work.when_idle(|| self.finish(Completion::drained()))
  }

  async fn run_dispatch_loop(self: Arc<Self>) {
    info!("Dispatch loop started.");
    let mut activity = self.work.subscribe_activity();

    loop {
      let admitted = self.admit_available();
      if admitted > 0 {
        trace!(
          admitted,
          running = self.work.running_count(),
          pending = self.work.pending_count(),
          "Dispatch pass admitted tasks."
        );
      }

      tokio::select! {
        biased;
        _ = self.dispatch_token.cancelled() => break,
        _ = activity.changed() => {}
        _ = sleep(self.config.refresh_interval) => {}
      }
    }

    info!(
      running = self.work.running_count(),
      pending = self.work.pending_count(),
      "Dispatch loop stopped."
    );
    self.finish_if_idle();
  }

  async fn run_completion_monitor(self: Arc<Self>) {
    debug!("Completion monitor started.");
    let mut activity = self.work.subscribe_activity();
    let mut state_rx = self.state.subscribe();

    loop {
      let state = self.state.get();
      if state.is_finished() && self.dispatch_token.is_cancelled() {
        break;
      }
      if !state.is_finished() {
        self.finish_if_idle();
      }
      tokio::select! {
        biased;
        _ = self.closed_token.cancelled() => {
          debug!("Scheduler dropped. Completion monitor exiting.");
          break;
        }
        _ = state_rx.changed() => {}
        _ = activity.changed() => {}
        _ = sleep(self.config.refresh_interval) => {}
      }
    }
    debug!("Completion monitor stopped.");
  }

  async fn run_shutdown_controller(self: Arc<Self>) {
    let mut activity = self.work.subscribe_activity();
    let mut grace_spent = false;

    loop {
      while self.work.running_count() > 0 {
        trace!(running = self.work.running_count(), "Waiting for running tasks to drain.");
        tokio::select! {
          biased;
          _ = self.closed_token.cancelled() => return,
          _ = activity.changed() => {}
          _ = sleep(self.config.refresh_interval) => {}
        }
      }

      if self.state.get().is_finished() {
        return;
      }

      let pending = self.work.pending_count();
      if pending > 0 && !grace_spent {
        warn!(
          pending,
          grace_timeout_ms = self.config.grace_timeout.as_millis() as u64,
          "Running tasks drained with work still queued. Waiting grace timeout before abandoning it."
        );
        tokio::select! {
          biased;
          _ = self.closed_token.cancelled() => return,
          _ = self.state.wait_finished() => return,
          _ = sleep(self.config.grace_timeout) => {}
        }
        grace_spent = true;
      }

      let finished = self.work.when_drained(|abandoned| {
        if abandoned == 0 {
          self.finish(Completion::drained());
        } else {
          self.finish(Completion::forced(abandoned));
        }
      });
      if finished.is_some() {
        return;
      }
      debug!(running = self.work.running_count(), "Running set not empty at finish; draining again.");
    }
  }
}

impl Drop for Scheduler {
  fn drop(&mut self) {
    let state = self.core.state.get();
    if state.is_finished() {
      trace!(scheduler = %self.core.name, "Drop: Scheduler already finished.");
    } else if state != LifecycleState::Idle {
      let running: Vec<u64> = self.core.work.running_labels().into_iter().map(|(id, _)| id).collect();
      info!(
        scheduler = %self.core.name,
        %state,
        ?running,
        pending = self.core.work.pending_count(),
        "Scheduler dropped before finishing. Cancelling background loops; running tasks continue detached."
      );
    }
    self.core.closed_token.cancel();
  }
}
