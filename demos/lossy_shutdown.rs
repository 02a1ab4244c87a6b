use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;
use worker_orchestra::{Scheduler, SchedulerConfig, Task};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Lossy Shutdown Example ---");

  let config = SchedulerConfig::new("lossy_scheduler").with_grace_timeout(Duration::from_secs(1));
  let scheduler = Scheduler::new(config, Handle::current());

  // Tasks 0, 1 are admitted by start(2). Tasks 2, 3, 4 stay queued.
  for i in 0..5 {
    scheduler
      .add(Task::blocking(move || {
        info!("Task {} running", i);
        std::thread::sleep(Duration::from_secs(2));
        Ok(())
      }))
      .expect("scheduler accepts tasks before start");
  }

  let started = std::time::Instant::now();
  scheduler.start(2).expect("valid concurrency bound");
  scheduler.stop().expect("scheduler was started");
  info!(
    "Stopped with {} running and {} pending.",
    scheduler.running_count(),
    scheduler.pending_count()
  );

  let completion = scheduler.join().await.expect("scheduler was started");
  info!(
    "Joined after {:.1}s. Forced: {}, abandoned: {}, still queued: {}",
    started.elapsed().as_secs_f32(),
    completion.forced,
    completion.abandoned,
    scheduler.pending_count()
  );
  info!("--- Lossy Shutdown Example End ---");
}
