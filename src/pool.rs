use crate::error::QueueError;
use crate::handle::TaskHandle;
use crate::task::{TaskId, TaskToExecute};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for currently running tasks to complete.
  /// Queued tasks that haven't started will not be processed.
  Graceful,
  /// Aborts all running tasks.
  /// Queued tasks that haven't started will not be processed.
  ForcefulCancel,
}

/// A task waiting in the pool's channel.
struct ManagedTask<R: Send + 'static> {
  task_id: TaskId,
  future: TaskToExecute<R>,
  token: CancellationToken,
  result_sender: oneshot::Sender<Result<R, QueueError>>,
}

type SharedReceiver<R> = Arc<AsyncMutex<mpsc::UnboundedReceiver<ManagedTask<R>>>>;

/// The pull-based variant of the bounded queue.
///
/// `concurrency_limit` persistent workers each pull the oldest queued task,
/// run it to completion and pull again. Idle workers wait on the receiver lock,
/// which is fair, so they take turns in arrival order.
pub struct WorkerPool<R: Send + 'static> {
  pool_name: Arc<String>,
  concurrency_limit: usize,
  next_task_id: AtomicU64,
  task_queue_tx: Mutex<Option<mpsc::UnboundedSender<ManagedTask<R>>>>,
  task_queue_rx: SharedReceiver<R>,
  queued_tasks: Arc<AtomicUsize>,
  active_tasks: Arc<DashMap<TaskId, Instant>>,
  shutdown_token: CancellationToken,
  abort_token: CancellationToken,
  worker_join_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: Send + 'static> WorkerPool<R> {
  /// Spawns `concurrency_limit` workers on `tokio_handle`.
  ///
  /// # Errors
  /// Returns `QueueError::InvalidArgument` if `concurrency_limit` is zero.
  pub fn new(concurrency_limit: usize, tokio_handle: TokioHandle, pool_name: &str) -> Result<Arc<Self>, QueueError> {
    if concurrency_limit == 0 {
      return Err(QueueError::InvalidArgument(format!(
        "concurrency limit for pool '{}' must be at least 1",
        pool_name
      )));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let pool = Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      concurrency_limit,
      next_task_id: AtomicU64::new(0),
      task_queue_tx: Mutex::new(Some(tx)),
      task_queue_rx: Arc::new(AsyncMutex::new(rx)),
      queued_tasks: Arc::new(AtomicUsize::new(0)),
      active_tasks: Arc::new(DashMap::new()),
      shutdown_token: CancellationToken::new(),
      abort_token: CancellationToken::new(),
      worker_join_handles: Mutex::new(Vec::with_capacity(concurrency_limit)),
    });

    let mut handles = Vec::with_capacity(concurrency_limit);
    for worker_id in 0..concurrency_limit {
      let worker = Worker {
        worker_id,
        pool_name: pool.pool_name.clone(),
        task_queue_rx: pool.task_queue_rx.clone(),
        queued_tasks: pool.queued_tasks.clone(),
        active_tasks: pool.active_tasks.clone(),
        shutdown_token: pool.shutdown_token.clone(),
        abort_token: pool.abort_token.clone(),
      };
      handles.push(
        tokio_handle.spawn(
          worker
            .run()
            .instrument(info_span!("worker_pool_worker", pool_name = %pool_name, worker_id)),
        ),
      );
    }
    *pool.worker_join_handles.lock() = handles;

    info!(%pool_name, concurrency_limit, "Worker pool started.");
    Ok(pool)
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn concurrency_limit(&self) -> usize {
    self.concurrency_limit
  }

  /// Returns the number of tasks currently being run by a worker.
  pub fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  /// Returns the current number of tasks in the pending queue.
  ///
  /// A task cancelled through its handle while queued is still counted until
  /// a worker pulls it and skips it.
  pub fn queued_task_count(&self) -> usize {
    self.queued_tasks.load(AtomicOrdering::Acquire)
  }

  /// Enqueues a task without waiting. The returned handle yields its result.
  ///
  /// # Errors
  /// Returns `QueueError::QueueShuttingDown` once shutdown has started.
  pub fn submit(&self, task_future: TaskToExecute<R>) -> Result<TaskHandle<R>, QueueError> {
    let sender_guard = self.task_queue_tx.lock();
    let sender = match sender_guard.as_ref() {
      Some(sender) if !self.shutdown_token.is_cancelled() => sender,
      _ => {
        warn!(pool_name = %self.pool_name, "Submit: Attempted to submit task to a pool that is shutting down or closed.");
        return Err(QueueError::QueueShuttingDown);
      }
    };

    let task_id = self.next_task_id.fetch_add(1, AtomicOrdering::Relaxed);
    let token = CancellationToken::new();
    let (result_tx, result_rx) = oneshot::channel::<Result<R, QueueError>>();

    // Counted before sending so a fast worker never decrements below zero.
    self.queued_tasks.fetch_add(1, AtomicOrdering::AcqRel);
    let managed_task = ManagedTask {
      task_id,
      future: task_future,
      token: token.clone(),
      result_sender: result_tx,
    };

    if sender.send(managed_task).is_err() {
      self.queued_tasks.fetch_sub(1, AtomicOrdering::AcqRel);
      error!(pool_name = %self.pool_name, %task_id, "Submit: Task channel closed unexpectedly.");
      return Err(QueueError::QueueShuttingDown);
    }

    debug!(pool_name = %self.pool_name, %task_id, "Task submitted to queue.");
    Ok(TaskHandle::new(task_id, token, result_rx))
  }

  /// Stops the pool. Safe to call more than once and from several clones of the `Arc`.
  ///
  /// Tasks still queued are answered with `QueueError::QueueShuttingDown`.
  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), QueueError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      // Closing the channel before signalling workers means no task can be
      // sent after the last worker drained the queue.
      self.task_queue_tx.lock().take();
      self.shutdown_token.cancel();
    } else {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    // Escalation is allowed even if a graceful shutdown is already underway.
    if mode == ShutdownMode::ForcefulCancel && !self.abort_token.is_cancelled() {
      info!(pool_name = %self.pool_name, "Forceful shutdown: Aborting all running tasks.");
      for entry in self.active_tasks.iter() {
        let (task_id, started_at) = entry.pair();
        debug!(
          pool_name = %self.pool_name,
          %task_id,
          elapsed_ms = started_at.elapsed().as_millis() as u64,
          "Aborting running task."
        );
      }
      self.abort_token.cancel();
    }

    let handles_to_await: Vec<JoinHandle<()>> = std::mem::take(&mut *self.worker_join_handles.lock());
    if handles_to_await.is_empty() {
      trace!(pool_name = %self.pool_name, "Worker join handles already taken by a concurrent shutdown.");
    } else {
      info!(pool_name = %self.pool_name, workers = handles_to_await.len(), "Waiting for workers to join.");
      for handle in handles_to_await {
        if let Err(join_error) = handle.await {
          error!(pool_name = %self.pool_name, "Error joining worker during shutdown: {:?}.", join_error);
        }
      }
    }

    reject_queued_tasks(&self.pool_name, &self.task_queue_rx, &self.queued_tasks).await;

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Pool shutdown process completed by this call.");
    }
    Ok(())
  }
}

/// Answers every task still in the channel with `QueueError::QueueShuttingDown`.
///
/// Run by each worker as it stops and by `shutdown`, so queued tasks are
/// answered whether the pool was shut down explicitly or dropped.
async fn reject_queued_tasks<R: Send + 'static>(
  pool_name: &str,
  task_queue_rx: &SharedReceiver<R>,
  queued_tasks: &AtomicUsize,
) {
  let mut rx = task_queue_rx.lock().await;
  let mut rejected = 0usize;
  while let Ok(task) = rx.try_recv() {
    queued_tasks.fetch_sub(1, AtomicOrdering::AcqRel);
    trace!(%pool_name, task_id = %task.task_id, "Rejecting queued task at shutdown.");
    let _ = task.result_sender.send(Err(QueueError::QueueShuttingDown));
    rejected += 1;
  }
  if rejected > 0 {
    info!(%pool_name, rejected, "Queued tasks were not started because of shutdown.");
  }
}

impl<R: Send + 'static> Drop for WorkerPool<R> {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool instance dropped. Initiating implicit graceful shutdown."
      );
      // Workers stop at their next pull and answer whatever is still queued;
      // running tasks finish. Nothing is awaited here.
      self.task_queue_tx.lock().take();
      self.shutdown_token.cancel();
    } else {
      trace!(
        pool_name = %*self.pool_name,
        "Drop: Shutdown already in progress or completed. No new signals sent."
      );
    }
  }
}

/// One persistent consumer of the pool's channel.
struct Worker<R: Send + 'static> {
  worker_id: usize,
  pool_name: Arc<String>,
  task_queue_rx: SharedReceiver<R>,
  queued_tasks: Arc<AtomicUsize>,
  active_tasks: Arc<DashMap<TaskId, Instant>>,
  shutdown_token: CancellationToken,
  abort_token: CancellationToken,
}

impl<R: Send + 'static> Worker<R> {
  async fn run(self) {
    info!(name = %*self.pool_name, worker_id = self.worker_id, "Worker started.");

    while let Some(task) = self.next_task().await {
      self.queued_tasks.fetch_sub(1, AtomicOrdering::AcqRel);
      self.run_task(task).await;
    }

    reject_queued_tasks(&self.pool_name, &self.task_queue_rx, &self.queued_tasks).await;
    info!(name = %*self.pool_name, worker_id = self.worker_id, "Worker stopped.");
  }

  /// Pulls the head of the queue, or `None` once the pool is shutting down.
  async fn next_task(&self) -> Option<ManagedTask<R>> {
    let mut rx = tokio::select! {
      biased;
      _ = self.shutdown_token.cancelled() => return None,
      guard = self.task_queue_rx.lock() => guard,
    };
    tokio::select! {
      biased;
      _ = self.shutdown_token.cancelled() => None,
      task = rx.recv() => task,
    }
  }

  async fn run_task(&self, task: ManagedTask<R>) {
    let ManagedTask {
      task_id,
      future,
      token,
      result_sender,
    } = task;

    if token.is_cancelled() {
      debug!(name = %*self.pool_name, %task_id, "Dequeued task already cancelled. Skipping.");
      let _ = result_sender.send(Err(QueueError::TaskCancelled));
      return;
    }

    self.active_tasks.insert(task_id, Instant::now());
    debug!(name = %*self.pool_name, %task_id, worker_id = self.worker_id, "Running dequeued task.");

    let execution_outcome: Result<R, QueueError> = tokio::select! {
      biased;
      _ = self.abort_token.cancelled() => {
        debug!(name = %*self.pool_name, %task_id, "Task aborted by forceful shutdown.");
        Err(QueueError::TaskCancelled)
      },
      task_result = AssertUnwindSafe(future).catch_unwind() => {
        match task_result {
          Ok(actual_result) => {
            trace!(name = %*self.pool_name, %task_id, "Task executed successfully.");
            Ok(actual_result)
          },
          Err(_panic_payload) => {
            error!(name = %*self.pool_name, %task_id, "Task panicked during execution.");
            Err(QueueError::TaskPanicked)
          }
        }
      }
    };

    self.active_tasks.remove(&task_id);
    if result_sender.send(execution_outcome).is_err() {
      warn!(
        name = %*self.pool_name,
        %task_id,
        "Result receiver for task was dropped. Task outcome may have been lost."
      );
    }
  }
}
