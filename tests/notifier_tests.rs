use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle as TokioHandle;
use tokio::time::sleep;
use worker_orchestra::{Scheduler, SchedulerConfig, Task, TaskCompletionInfo, TaskCompletionStatus, TaskResult};

// Helper to initialize tracing for tests
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,worker_orchestra=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn test_config(name: &str) -> SchedulerConfig {
  SchedulerConfig::new(name)
    .with_refresh_interval(Duration::from_millis(2))
    .with_grace_timeout(Duration::from_millis(100))
}

// Helper for collecting notifications in tests
fn create_collecting_handler() -> (
  Arc<Mutex<Vec<TaskCompletionInfo>>>,
  impl Fn(TaskCompletionInfo) + Send + Sync + 'static,
) {
  let collected_notifications = Arc::new(Mutex::new(Vec::new()));
  let collected_notifications_clone = collected_notifications.clone();
  let handler = move |info: TaskCompletionInfo| {
    tracing::debug!(
      "Test Collecting Handler: Received notification for task_id: {}, status: {:?}",
      info.task_id,
      info.status
    );
    collected_notifications_clone.lock().unwrap().push(info);
  };
  (collected_notifications, handler)
}

fn sleeping_task(label: &str, duration_ms: u64) -> Task {
  Task::from_future(async move {
    sleep(Duration::from_millis(duration_ms)).await;
    Ok(())
  })
  .with_label(label)
}

async fn panicking_body() -> TaskResult {
  panic!("intentional panic inside task body");
}

fn status_of<'a>(notifications: &'a [TaskCompletionInfo], label: &str) -> &'a TaskCompletionStatus {
  &notifications
    .iter()
    .find(|info| info.label.as_deref() == Some(label))
    .unwrap_or_else(|| panic!("no notification for {}", label))
    .status
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_handler_reports_every_outcome() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(test_config("test_notifier_outcomes"), TokioHandle::current());
  let (notifications, handler) = create_collecting_handler();
  scheduler.add_completion_handler(handler);

  scheduler.add(sleeping_task("ok", 20)).unwrap();
  scheduler
    .add(Task::from_future(async { Err("connection reset".into()) }).with_label("async_err"))
    .unwrap();
  scheduler.add(Task::from_future(panicking_body()).with_label("async_panic")).unwrap();
  scheduler
    .add(Task::blocking(|| Err("checksum mismatch".into())).with_label("blocking_err"))
    .unwrap();
  scheduler
    .add(Task::blocking(|| panic!("blocking body gave up")).with_label("blocking_panic"))
    .unwrap();

  scheduler.start(2).unwrap();
  scheduler.join().await.unwrap();

  let notifications = notifications.lock().unwrap();
  assert_eq!(notifications.len(), 5);
  assert_eq!(*status_of(&notifications, "ok"), TaskCompletionStatus::Succeeded);
  assert_eq!(
    *status_of(&notifications, "async_err"),
    TaskCompletionStatus::Failed("connection reset".to_string())
  );
  assert_eq!(*status_of(&notifications, "async_panic"), TaskCompletionStatus::Panicked);
  assert_eq!(
    *status_of(&notifications, "blocking_err"),
    TaskCompletionStatus::Failed("checksum mismatch".to_string())
  );
  assert_eq!(*status_of(&notifications, "blocking_panic"), TaskCompletionStatus::Panicked);

  let ids: HashSet<u64> = notifications.iter().map(|info| info.task_id).collect();
  assert_eq!(ids.len(), 5, "Task ids must be unique.");
  for info in notifications.iter() {
    assert_eq!(info.scheduler_name.as_str(), "test_notifier_outcomes");
  }
  assert!(status_of(&notifications, "ok").is_success());
}

#[tokio::test]
async fn test_elapsed_covers_task_runtime() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(test_config("test_notifier_elapsed"), TokioHandle::current());
  let (notifications, handler) = create_collecting_handler();
  scheduler.add_completion_handler(handler);

  scheduler.add(sleeping_task("slow", 60)).unwrap();
  scheduler.start(1).unwrap();
  scheduler.join().await.unwrap();

  let notifications = notifications.lock().unwrap();
  assert_eq!(notifications.len(), 1);
  assert!(notifications[0].elapsed >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_multiple_handlers_and_panicking_handler() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(test_config("test_notifier_multi"), TokioHandle::current());
  let (first, first_handler) = create_collecting_handler();
  let (second, second_handler) = create_collecting_handler();
  scheduler.add_completion_handler(first_handler);
  scheduler.add_completion_handler(|_| panic!("handler panics on every notification"));
  scheduler.add_completion_handler(second_handler);

  for i in 0..4 {
    scheduler.add(sleeping_task(&format!("multi_{}", i), 5)).unwrap();
  }
  scheduler.start(2).unwrap();
  let completion = scheduler.join().await.unwrap();

  assert!(completion.is_lossless());
  assert_eq!(first.lock().unwrap().len(), 4);
  assert_eq!(second.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_abandoned_tasks_are_not_reported() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(test_config("test_notifier_abandoned"), TokioHandle::current());
  let (notifications, handler) = create_collecting_handler();
  scheduler.add_completion_handler(handler);

  for i in 0..3 {
    scheduler.add(sleeping_task(&format!("abandon_{}", i), 30)).unwrap();
  }
  scheduler.start(1).unwrap();
  scheduler.stop().unwrap();
  let completion = scheduler.join().await.unwrap();

  assert!(completion.forced);
  assert_eq!(completion.abandoned, 2);
  let notifications = notifications.lock().unwrap();
  assert_eq!(notifications.len(), 1);
  assert_eq!(notifications[0].label.as_deref(), Some("abandon_0"));
}

#[tokio::test]
async fn test_handler_added_while_running_sees_later_completions() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(test_config("test_notifier_late_handler"), TokioHandle::current());
  let seen = Arc::new(AtomicUsize::new(0));

  scheduler.add(sleeping_task("first", 5)).unwrap();
  scheduler.add(sleeping_task("second", 80)).unwrap();
  scheduler.start(1).unwrap();
  sleep(Duration::from_millis(40)).await;

  {
    let seen = seen.clone();
    scheduler.add_completion_handler(move |info| {
      assert_eq!(info.label.as_deref(), Some("second"));
      seen.fetch_add(1, Ordering::SeqCst);
    });
  }
  scheduler.join().await.unwrap();
  assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_all_wait_for_slow_handler() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(test_config("test_concurrent_joins"), TokioHandle::current());
  let handled = Arc::new(AtomicUsize::new(0));
  {
    let handled = handled.clone();
    scheduler.add_completion_handler(move |_| {
      std::thread::sleep(Duration::from_millis(300));
      handled.fetch_add(1, Ordering::SeqCst);
    });
  }
  scheduler.add(sleeping_task("slow_handler", 5)).unwrap();
  scheduler.start(1).unwrap();
  scheduler.stop().unwrap();

  let joiners: Vec<_> = (0..3)
    .map(|_| {
      let scheduler = scheduler.clone();
      let handled = handled.clone();
      tokio::spawn(async move {
        let completion = scheduler.join().await.unwrap();
        (completion, handled.load(Ordering::SeqCst))
      })
    })
    .collect();

  for joiner in joiners {
    let (completion, handled_at_return) = joiner.await.unwrap();
    assert!(completion.is_lossless());
    assert_eq!(handled_at_return, 1, "every join must wait for the handler");
  }
}

#[tokio::test]
async fn test_handlers_see_tasks_added_after_running_out_of_work() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(test_config("test_notifier_rearm"), TokioHandle::current());
  let (notifications, handler) = create_collecting_handler();
  scheduler.add_completion_handler(handler);
  scheduler.start(2).unwrap();
  assert!(scheduler.join().await.unwrap().is_lossless());

  scheduler.add(sleeping_task("late_first", 5)).unwrap();
  scheduler.add(sleeping_task("late_second", 5)).unwrap();
  scheduler.join().await.unwrap();

  let notifications = notifications.lock().unwrap();
  assert_eq!(notifications.len(), 2);
  assert!(status_of(&notifications, "late_first").is_success());
  assert!(status_of(&notifications, "late_second").is_success());
}
