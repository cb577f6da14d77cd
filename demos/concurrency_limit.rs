use bounded_task_queue::{CompletionHandle, TaskHandle, TaskQueue};
use std::time::Duration;
use tracing::info;

async fn long_task_fn(id: usize) -> String {
  info!("Task {} starting (concurrency test - should take 1s)", id);
  tokio::time::sleep(Duration::from_secs(1)).await;
  let result = format!("Task {} finished", id);
  info!("{}", result);
  result
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Concurrency Limit Example (Limit: 2) ---");

  let concurrency_limit = 2;
  let queue = TaskQueue::with_name(concurrency_limit, "concurrency_queue").expect("valid concurrency limit");

  let num_tasks = 5;
  let mut handles: Vec<TaskHandle<String>> = Vec::new();

  info!(
    "Submitting {} tasks, each takes 1 sec. With concurrency {}, this should take ~{} secs.",
    num_tasks,
    concurrency_limit,
    (num_tasks as f32 / concurrency_limit as f32).ceil()
  );

  for i in 0..num_tasks {
    match queue.spawn(long_task_fn(i)) {
      Ok(handle) => handles.push(handle),
      Err(e) => tracing::error!("Failed to submit task {}: {:?}", i, e),
    }
  }

  // Callback-style tasks share the same slots as spawned futures.
  queue.submit(|done: CompletionHandle| {
    info!("Callback task {} admitted", done.task_id());
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      if let Err(e) = done.fail("callback task gave up") {
        tracing::error!("Completion rejected: {}", e);
      }
    });
  });

  info!("running={} pending={}", queue.running(), queue.pending());

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(result) => info!("Task {} main: Received result: {}", task_id, result),
      Err(e) => info!("Task {} main: Received error: {:?}", task_id, e),
    }
  }

  // A slot can also be borrowed directly and returned when the work is done.
  match queue.acquire().await {
    Ok(slot) => {
      info!("Acquired slot {} (running={})", slot.task_id(), queue.running());
      tokio::time::sleep(Duration::from_millis(100)).await;
      if let Err(e) = slot.done() {
        tracing::error!("Release rejected: {}", e);
      }
    }
    Err(e) => tracing::error!("Failed to acquire a slot: {:?}", e),
  }

  queue.idle().await;
  info!("Queue drained.");
  info!("--- Concurrency Limit Example End ---");
}
