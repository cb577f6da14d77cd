use bounded_task_queue::{CompletionHandle, QueueError, TaskQueue};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bounded_task_queue=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// Tracks how many tasks are inside their critical section and the peak seen.
#[derive(Default)]
struct ConcurrencyGauge {
  current: AtomicUsize,
  peak: AtomicUsize,
}

impl ConcurrencyGauge {
  fn enter(&self) {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
  }

  fn exit(&self) {
    self.current.fetch_sub(1, Ordering::SeqCst);
  }

  fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

// Submits a callback task that records its admission, works for `delay_ms`
// on the runtime and then signals through its completion handle.
fn submit_timed(
  queue: &TaskQueue,
  label: usize,
  delay_ms: u64,
  admitted: &Arc<Mutex<Vec<usize>>>,
  gauge: &Arc<ConcurrencyGauge>,
) {
  let admitted = admitted.clone();
  let gauge = gauge.clone();
  queue.submit(move |done: CompletionHandle| {
    admitted.lock().push(label);
    gauge.enter();
    tokio::spawn(async move {
      sleep(Duration::from_millis(delay_ms)).await;
      gauge.exit();
      done.done().unwrap();
    });
  });
}

#[tokio::test]
async fn test_limit_two_runs_five_tasks_two_at_a_time() {
  setup_tracing_for_test();
  let queue = TaskQueue::with_name(2, "limit_two").unwrap();
  let admitted = Arc::new(Mutex::new(Vec::new()));
  let gauge = Arc::new(ConcurrencyGauge::default());

  for i in 0..5 {
    submit_timed(&queue, i, 50, &admitted, &gauge);
  }
  assert_eq!(*admitted.lock(), vec![0, 1]);
  assert_eq!(queue.running(), 2);
  assert_eq!(queue.pending(), 3);

  sleep(Duration::from_millis(20)).await;
  assert_eq!(admitted.lock().len(), 2, "Task 3 must wait for a free slot.");

  queue.idle().await;
  assert_eq!(*admitted.lock(), vec![0, 1, 2, 3, 4]);
  assert_eq!(gauge.peak(), 2);
  assert_eq!(queue.running(), 0);
  assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn test_task_that_never_completes_blocks_the_next_one() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();
  let parked: Arc<Mutex<Option<CompletionHandle>>> = Arc::new(Mutex::new(None));
  let second_started = Arc::new(AtomicBool::new(false));

  {
    let parked = parked.clone();
    queue.submit(move |done| *parked.lock() = Some(done));
  }
  {
    let second_started = second_started.clone();
    queue.submit(move |done| {
      second_started.store(true, Ordering::SeqCst);
      done.done().unwrap();
    });
  }

  sleep(Duration::from_millis(100)).await;
  assert!(!second_started.load(Ordering::SeqCst));
  assert_eq!(queue.running(), 1);
  assert_eq!(queue.pending(), 1);
  assert!(timeout(Duration::from_millis(50), queue.idle()).await.is_err());

  // Only completing the first task lets the second one in.
  let first = parked.lock().take().unwrap();
  first.done().unwrap();
  assert!(second_started.load(Ordering::SeqCst));
  queue.idle().await;
}

#[tokio::test]
async fn test_failing_tasks_report_their_own_errors_and_free_slots() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(3).unwrap();
  let mut receivers = Vec::new();

  for i in 0..3 {
    let (tx, rx) = oneshot::channel::<Result<(), String>>();
    receivers.push(rx);
    queue.submit(move |done| {
      let message = format!("task {} failed", i);
      let _ = tx.send(Err(message.clone()));
      done.fail(message).unwrap();
    });
  }

  for (i, rx) in receivers.into_iter().enumerate() {
    assert_eq!(rx.await.unwrap(), Err(format!("task {} failed", i)));
  }
  assert_eq!(queue.running(), 0);
  assert!(queue.is_idle());

  let handle = queue.spawn(async { "still usable" }).unwrap();
  assert_eq!(handle.await_result().await, Ok("still usable"));
}

#[tokio::test]
async fn test_idle_resolves_immediately_on_empty_queue() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();
  assert_eq!(queue.running(), 0);
  assert_eq!(queue.pending(), 0);
  timeout(Duration::from_millis(50), queue.idle())
    .await
    .expect("An empty queue is idle.");
}

#[tokio::test]
async fn test_zero_concurrency_is_invalid() {
  setup_tracing_for_test();
  match TaskQueue::with_name(0, "invalid") {
    Err(QueueError::InvalidArgument(message)) => assert!(message.contains("invalid")),
    other => panic!("Expected InvalidArgument, got {:?}", other),
  }
}

#[tokio::test]
async fn test_spawn_delivers_results_in_submission_order_with_limit_one() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();
  let completion_order = Arc::new(Mutex::new(Vec::new()));
  let mut handles = Vec::new();

  for i in 0..3u64 {
    let completion_order = completion_order.clone();
    // Later tasks are faster, so any overlap would reorder completions.
    let handle = queue
      .spawn(async move {
        sleep(Duration::from_millis(60 - i * 20)).await;
        completion_order.lock().push(i);
        format!("task_{}_done", i)
      })
      .unwrap();
    assert_eq!(handle.id(), i);
    handles.push(handle);
  }

  for (i, handle) in handles.into_iter().enumerate() {
    assert_eq!(handle.await_result().await, Ok(format!("task_{}_done", i)));
  }
  assert_eq!(*completion_order.lock(), vec![0, 1, 2]);
  queue.idle().await;
}

#[tokio::test]
async fn test_spawned_panic_is_reported_and_queue_keeps_going() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();

  let panicking = queue
    .spawn(async {
      sleep(Duration::from_millis(10)).await;
      panic!("spawned task intentionally panicked");
    })
    .unwrap();
  let normal = queue.spawn(async { 7u32 }).unwrap();

  assert_eq!(panicking.await_result().await, Err::<(), _>(QueueError::TaskPanicked));
  assert_eq!(normal.await_result().await, Ok(7));
  queue.idle().await;
}

#[tokio::test]
async fn test_cancelled_spawn_is_never_polled() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();
  let polled = Arc::new(AtomicBool::new(false));

  let blocker = queue
    .spawn(async {
      sleep(Duration::from_millis(50)).await;
    })
    .unwrap();
  let cancelled = {
    let polled = polled.clone();
    queue
      .spawn(async move {
        polled.store(true, Ordering::SeqCst);
      })
      .unwrap()
  };
  cancelled.cancel();
  assert!(cancelled.is_cancellation_requested());

  assert_eq!(blocker.await_result().await, Ok(()));
  assert_eq!(cancelled.await_result().await, Err(QueueError::TaskCancelled));
  assert!(!polled.load(Ordering::SeqCst));
  queue.idle().await;
}

#[tokio::test]
async fn test_cancel_pending_removes_callback_task() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();
  let admitted = Arc::new(Mutex::new(Vec::new()));
  let gauge = Arc::new(ConcurrencyGauge::default());

  submit_timed(&queue, 0, 30, &admitted, &gauge);
  submit_timed(&queue, 1, 30, &admitted, &gauge);
  submit_timed(&queue, 2, 30, &admitted, &gauge);
  assert!(queue.cancel_pending(1));

  queue.idle().await;
  assert_eq!(*admitted.lock(), vec![0, 2]);
}

#[tokio::test]
async fn test_double_completion_from_async_task_is_rejected() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();
  let (tx, rx) = oneshot::channel();

  queue.submit(move |done| {
    tokio::spawn(async move {
      let first = done.done();
      let second = done.done();
      let _ = tx.send((first, second));
    });
  });
  let follow_up = queue.spawn(async { "follow_up" }).unwrap();

  let (first, second) = rx.await.unwrap();
  assert_eq!(first, Ok(()));
  assert!(matches!(second, Err(QueueError::LogicError(_))));
  assert_eq!(follow_up.await_result().await, Ok("follow_up"));
  queue.idle().await;
  assert_eq!(queue.running(), 0);
}

#[tokio::test]
async fn test_idle_waits_for_last_completion() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(2).unwrap();
  let finished = Arc::new(AtomicUsize::new(0));

  for delay in [20u64, 40, 60] {
    let finished = finished.clone();
    queue
      .spawn(async move {
        sleep(Duration::from_millis(delay)).await;
        finished.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap();
  }

  queue.idle().await;
  assert_eq!(finished.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_and_fifo_under_parallel_completions() {
  setup_tracing_for_test();
  let limit = 4;
  let num_tasks = 60;
  let queue = TaskQueue::with_name(limit, "parallel_completions").unwrap();
  let admitted = Arc::new(Mutex::new(Vec::new()));
  let gauge = Arc::new(ConcurrencyGauge::default());

  for i in 0..num_tasks {
    let delay_ms = rand::rng().random_range(1..15u64);
    submit_timed(&queue, i, delay_ms, &admitted, &gauge);
  }

  timeout(Duration::from_secs(10), queue.idle())
    .await
    .expect("All tasks should drain.");

  assert!(gauge.peak() <= limit, "Peak concurrency {} exceeded the limit", gauge.peak());
  assert_eq!(*admitted.lock(), (0..num_tasks).collect::<Vec<_>>());
  assert!(queue.is_idle());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clones_share_one_queue_across_submitters() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(3).unwrap();
  let gauge = Arc::new(ConcurrencyGauge::default());
  let mut submitters = Vec::new();

  for _ in 0..4 {
    let queue = queue.clone();
    let gauge = gauge.clone();
    submitters.push(tokio::spawn(async move {
      let mut handles = Vec::new();
      for _ in 0..10 {
        let gauge = gauge.clone();
        handles.push(
          queue
            .spawn(async move {
              gauge.enter();
              sleep(Duration::from_millis(5)).await;
              gauge.exit();
            })
            .unwrap(),
        );
      }
      for handle in handles {
        handle.await_result().await.unwrap();
      }
    }));
  }

  for submitter in submitters {
    submitter.await.unwrap();
  }
  assert!(gauge.peak() <= 3);
  queue.idle().await;
}

#[tokio::test]
async fn test_acquirers_wait_in_fifo_order_with_submitted_tasks() {
  setup_tracing_for_test();
  let queue = TaskQueue::with_name(1, "acquire_fifo").unwrap();
  let order = Arc::new(Mutex::new(Vec::new()));

  let first = queue.acquire().await.unwrap();
  assert_eq!(queue.running(), 1);

  let mut waiters = Vec::new();
  for label in 0..4 {
    let order = order.clone();
    if label == 1 {
      queue.submit(move |done| {
        order.lock().push(label);
        done.done().unwrap();
      });
    } else {
      let queue = queue.clone();
      waiters.push(tokio::spawn(async move {
        let slot = queue.acquire().await.unwrap();
        order.lock().push(label);
        sleep(Duration::from_millis(5)).await;
        slot.done().unwrap();
      }));
    }
    // Let the spawned acquirer register before the next one.
    sleep(Duration::from_millis(10)).await;
  }
  assert_eq!(queue.pending(), 4);
  assert!(order.lock().is_empty());

  first.done().unwrap();
  for waiter in waiters {
    waiter.await.unwrap();
  }
  assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
  assert!(queue.is_idle());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_and_spawn_share_the_limit() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(3).unwrap();
  let gauge = Arc::new(ConcurrencyGauge::default());
  let mut acquirers = Vec::new();
  let mut handles = Vec::new();

  for i in 0..20 {
    let gauge = gauge.clone();
    let delay = rand::rng().random_range(1..10);
    if i % 2 == 0 {
      let queue = queue.clone();
      acquirers.push(tokio::spawn(async move {
        let slot = queue.acquire().await.unwrap();
        gauge.enter();
        sleep(Duration::from_millis(delay)).await;
        gauge.exit();
        slot.done().unwrap();
      }));
    } else {
      handles.push(
        queue
          .spawn(async move {
            gauge.enter();
            sleep(Duration::from_millis(delay)).await;
            gauge.exit();
          })
          .unwrap(),
      );
    }
  }

  for acquirer in acquirers {
    acquirer.await.unwrap();
  }
  for handle in handles {
    handle.await_result().await.unwrap();
  }
  assert!(gauge.peak() <= 3);
  queue.idle().await;
}

#[tokio::test]
async fn test_abandoned_acquire_leaves_the_queue() {
  setup_tracing_for_test();
  let queue = TaskQueue::new(1).unwrap();
  let held = queue.acquire().await.unwrap();

  let timed_out = timeout(Duration::from_millis(20), queue.acquire()).await;
  assert!(timed_out.is_err());
  assert_eq!(queue.pending(), 0);

  held.done().unwrap();
  assert!(queue.is_idle());
  let again = queue.acquire().await.unwrap();
  assert_eq!(queue.running(), 1);
  drop(again);
  assert!(queue.is_idle());
}
