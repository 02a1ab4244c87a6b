use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;
use worker_orchestra::{Scheduler, SchedulerConfig, Task};

async fn greet(id: usize) -> worker_orchestra::TaskResult {
  info!("Task {} says hello", id);
  tokio::time::sleep(Duration::from_millis(100)).await;
  Ok(())
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Basic Usage Example ---");

  let scheduler = Scheduler::new(SchedulerConfig::new("basic_scheduler"), Handle::current());

  for i in 0..4 {
    if let Err(e) = scheduler.add(Task::from_future(greet(i)).with_label(format!("greet_{}", i))) {
      tracing::error!("Failed to add task {}: {}", i, e);
    }
  }
  info!("Queued {} tasks.", scheduler.pending_count());

  scheduler.start(2).expect("2 is a valid concurrency bound");
  info!(
    "Started. Running: {}, pending: {}",
    scheduler.running_count(),
    scheduler.pending_count()
  );

  let completion = scheduler.join().await.expect("scheduler was started");
  info!("Scheduler finished: {:?}", completion);
  info!("--- Basic Usage Example End ---");
}
