use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;
use worker_orchestra::{Scheduler, SchedulerConfig, Task};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  let concurrency_limit = 3;
  let num_tasks = 10;
  info!("--- Concurrency Limit Example (Limit: {}) ---", concurrency_limit);

  let scheduler = Scheduler::new(SchedulerConfig::new("concurrency_scheduler"), Handle::current());
  let concurrent = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));
  let start = Instant::now();

  for i in 0..num_tasks {
    let concurrent = concurrent.clone();
    let max_seen = max_seen.clone();
    scheduler
      .add(Task::from_future(async move {
        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        max_seen.fetch_max(now, Ordering::SeqCst);
        info!("[{:>4}ms] Task {:>2} started (concurrent: {})", start.elapsed().as_millis(), i, now);
        tokio::time::sleep(Duration::from_millis(200)).await;
        concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(())
      }))
      .expect("scheduler accepts tasks before start");
  }

  scheduler.start(concurrency_limit).expect("valid concurrency bound");
  scheduler.join().await.expect("scheduler was started");

  info!(
    "All {} tasks done in {}ms; max concurrency observed: {}",
    num_tasks,
    start.elapsed().as_millis(),
    max_seen.load(Ordering::SeqCst)
  );
  info!("--- Concurrency Limit Example End ---");
}
