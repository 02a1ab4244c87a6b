use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, Instrument};

// --- Public Event Structs for Handlers ---

/// Outcome of one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Succeeded,
  /// The body returned `Err`; carries the error's display text.
  Failed(String),
  Panicked,
}

impl TaskCompletionStatus {
  pub fn is_success(&self) -> bool {
    matches!(self, TaskCompletionStatus::Succeeded)
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub scheduler_name: Arc<String>,
  pub label: Option<Arc<str>>,
  pub status: TaskCompletionStatus,
  /// Time between admission and completion.
  pub elapsed: Duration,
  pub completion_time: SystemTime,
}

pub(crate) type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

// --- CompletionNotifier Struct ---

struct NotifierInternalState {
  internal_rx_for_init: Option<AsyncReceiver<TaskCompletionInfo>>,
  tokio_handle: TokioHandle,
}

/// Fans task outcomes out to user-registered handlers on a dedicated worker.
///
/// The worker is only spawned once the first handler is registered; until
/// then outcomes are not queued at all. A panicking handler is caught and
/// logged and never affects the scheduler or the other handlers.
///
/// `queued` counts notifications accepted by the worker's queue and
/// `delivered` the ones every handler has been called for, so any number of
/// waiters can tell when the handlers have caught up.
pub(crate) struct CompletionNotifier {
  scheduler_name: Arc<String>,
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  tx: AsyncSender<TaskCompletionInfo>,
  queued: AtomicU64,
  delivered: Arc<watch::Sender<u64>>,
  init_once: Once,
  internal_state_for_init: Mutex<NotifierInternalState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("scheduler_name", &self.scheduler_name)
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .field("queued", &self.queued.load(AtomicOrdering::Relaxed))
      .field("delivered", &*self.delivered.borrow())
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(tokio_handle: TokioHandle, scheduler_name: Arc<String>) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    let (delivered, _) = watch::channel(0u64);
    Self {
      scheduler_name,
      handlers: Arc::new(RwLock::new(Vec::new())),
      tx,
      queued: AtomicU64::new(0),
      delivered: Arc::new(delivered),
      init_once: Once::new(),
      internal_state_for_init: Mutex::new(NotifierInternalState {
        internal_rx_for_init: Some(rx),
        tokio_handle,
      }),
    }
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let mut state_guard = self.internal_state_for_init.lock();
      if let Some(rx_to_use) = state_guard.internal_rx_for_init.take() {
        info!(scheduler = %*self.scheduler_name, "First completion handler added. Initializing notification worker.");
        state_guard.tokio_handle.spawn(
          Self::run_notification_worker_loop(rx_to_use, self.handlers.clone(), self.delivered.clone())
            .instrument(info_span!("notification_worker_loop", scheduler = %*self.scheduler_name)),
        );
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.ensure_worker_initialized();
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(scheduler = %*self.scheduler_name, "Added completion handler. Total handlers: {}", handlers_guard.len());
  }

  /// Queues an outcome for the handlers. A no-op while no handler is
  /// registered or after `close()`.
  pub(crate) async fn notify(&self, info: TaskCompletionInfo) {
    if !self.init_once.is_completed() {
      return;
    }
    let task_id = info.task_id;
    match self.tx.send(info).await {
      Ok(()) => {
        self.queued.fetch_add(1, AtomicOrdering::AcqRel);
      }
      Err(_) => {
        trace!(scheduler = %*self.scheduler_name, %task_id, "Notifier closed, dropping completion notification.");
      }
    }
  }

  /// Closes the input queue. The worker processes what is already queued and
  /// then exits.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  async fn run_notification_worker_loop(
    queue_rx: AsyncReceiver<TaskCompletionInfo>,
    handlers_list_arc: Arc<RwLock<Vec<CompletionHandler>>>,
    delivered: Arc<watch::Sender<u64>>,
  ) {
    debug!("Notification worker started.");
    loop {
      match queue_rx.recv().await {
        Ok(info) => {
          let handlers: Vec<CompletionHandler> = handlers_list_arc.read().iter().cloned().collect();
          trace!(task_id = %info.task_id, status = ?info.status, "Dispatching notification to {} handlers.", handlers.len());
          for handler in handlers {
            let info_for_handler = info.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(info_for_handler)));
            if result.is_err() {
              error!(task_id = %info.task_id, "A completion handler panicked during execution.");
            }
          }
          delivered.send_modify(|count| *count += 1);
        }
        Err(RecvError::Disconnected) => {
          debug!("Notification queue closed and drained. Terminating.");
          break;
        }
      }
    }
  }

  /// Waits until every handler has been called for every notification queued
  /// before this call. Any number of callers may wait concurrently.
  pub(crate) async fn await_delivered(&self) {
    let target = self.queued.load(AtomicOrdering::Acquire);
    let mut delivered_rx = self.delivered.subscribe();
    if delivered_rx.wait_for(|delivered| *delivered >= target).await.is_err() {
      error!(scheduler = %*self.scheduler_name, "Notifier: Delivery counter closed while waiting.");
    }
  }
}
