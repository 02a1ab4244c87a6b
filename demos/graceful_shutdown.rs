use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;
use worker_orchestra::{Scheduler, SchedulerConfig, Task};

fn work_task(id: usize, duration_s: u64) -> Task {
  Task::blocking(move || {
    info!("Task {} starting (will block for {}s)", id, duration_s);
    std::thread::sleep(Duration::from_secs(duration_s));
    info!("Task {} finished after {}s", id, duration_s);
    Ok(())
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Graceful Shutdown Example ---");

  // Every task is admitted immediately, so stop() loses nothing even though
  // the tasks outlive the 3s grace timeout.
  let scheduler = Scheduler::new(SchedulerConfig::new("graceful_scheduler"), Handle::current());
  for i in 0..5 {
    scheduler.add(work_task(i, 4)).expect("scheduler accepts tasks before start");
  }

  let started = std::time::Instant::now();
  scheduler.start(5).expect("valid concurrency bound");
  scheduler.stop().expect("scheduler was started");

  info!("Attempting to add a task after stop...");
  match scheduler.add(work_task(99, 1)) {
    Ok(()) => tracing::error!("LATE ADD SUCCEEDED (UNEXPECTED!)"),
    Err(e) => info!("Late add correctly rejected: {}", e),
  }

  let completion = scheduler.join().await.expect("scheduler was started");
  info!("Joined after {:.1}s: {:?}", started.elapsed().as_secs_f32(), completion);
  info!("--- Graceful Shutdown Example End ---");
}
