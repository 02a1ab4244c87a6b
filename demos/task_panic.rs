use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;
use worker_orchestra::{Scheduler, SchedulerConfig, Task, TaskCompletionStatus, TaskResult};

async fn faulty_task() -> TaskResult {
  tokio::time::sleep(Duration::from_millis(100)).await;
  panic!("This task intentionally panicked!");
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Task Panic Example ---");

  let scheduler = Scheduler::new(SchedulerConfig::new("panic_scheduler"), Handle::current());
  scheduler.add_completion_handler(|info| {
    if info.status == TaskCompletionStatus::Panicked {
      info!("Observed panic in task {} ({:?})", info.task_id, info.label);
    }
  });

  scheduler
    .add(Task::from_future(faulty_task()).with_label("faulty"))
    .expect("scheduler accepts tasks before start");
  scheduler
    .add(
      Task::from_future(async {
        info!("The slot freed by the panicking task is reused.");
        Ok(())
      })
      .with_label("healthy"),
    )
    .expect("scheduler accepts tasks before start");

  // One slot: the healthy task can only run if the panic released it.
  scheduler.start(1).expect("valid concurrency bound");
  let completion = scheduler.join().await.expect("scheduler was started");
  info!("Scheduler finished: {:?}", completion);
  info!("--- Task Panic Example End ---");
}
