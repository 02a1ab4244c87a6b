use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};
use worker_orchestra::{Scheduler, SchedulerConfig, Task, TaskCompletionInfo, TaskCompletionStatus};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Completion Notifier Example ---");

  let scheduler = Scheduler::new(SchedulerConfig::new("notifier_scheduler"), Handle::current());
  let failures = Arc::new(AtomicUsize::new(0));

  {
    let failures = failures.clone();
    scheduler.add_completion_handler(move |info: TaskCompletionInfo| match &info.status {
      TaskCompletionStatus::Succeeded => {
        info!("Handler: task {} ({:?}) succeeded in {:?}", info.task_id, info.label, info.elapsed)
      }
      TaskCompletionStatus::Failed(reason) => {
        failures.fetch_add(1, Ordering::SeqCst);
        warn!("Handler: task {} ({:?}) failed: {}", info.task_id, info.label, reason);
      }
      TaskCompletionStatus::Panicked => {
        failures.fetch_add(1, Ordering::SeqCst);
        warn!("Handler: task {} ({:?}) panicked", info.task_id, info.label);
      }
    });
  }

  for i in 0..6 {
    let task = Task::from_future(async move {
      tokio::time::sleep(Duration::from_millis(50 * (i as u64 + 1))).await;
      if i % 3 == 2 {
        return Err(format!("item {} could not be processed", i).into());
      }
      Ok(())
    })
    .with_label(format!("item_{}", i));
    scheduler.add(task).expect("scheduler accepts tasks before start");
  }

  scheduler.start(3).expect("valid concurrency bound");
  scheduler.join().await.expect("scheduler was started");
  info!("Failures observed by handler: {}", failures.load(Ordering::SeqCst));
  info!("--- Completion Notifier Example End ---");
}
