use crate::completion::CompletionHandle;
use crate::error::QueueError;
use crate::handle::TaskHandle;
use crate::task::{PendingTask, TaskId};

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

const DEFAULT_QUEUE_NAME: &str = "default";

/// A push-based queue that admits at most `concurrency_limit` tasks at once.
///
/// Tasks wait in FIFO order. Every submit and every completion runs the
/// dispatch step, which hands free slots to the oldest waiting tasks. Each
/// admitted task receives a [`CompletionHandle`] and must signal through it
/// once its work is done.
///
/// `TaskQueue` is a cheap handle; clones share the same queue.
#[derive(Clone)]
pub struct TaskQueue {
  shared: Arc<QueueShared>,
}

pub(crate) struct QueueShared {
  name: Arc<String>,
  concurrency_limit: usize,
  state: Mutex<QueueState>,
  idle: Notify,
}

struct QueueState {
  next_task_id: TaskId,
  running: usize,
  pending: VecDeque<PendingTask>,
  // Set while one caller owns the dispatch loop. Everyone else only records
  // their change and leaves admission to that caller.
  dispatching: bool,
}

impl QueueState {
  fn is_idle(&self) -> bool {
    self.running == 0 && self.pending.is_empty()
  }
}

impl TaskQueue {
  /// Creates a queue that runs at most `concurrency_limit` tasks at once.
  ///
  /// # Errors
  /// Returns `QueueError::InvalidArgument` if `concurrency_limit` is zero.
  pub fn new(concurrency_limit: usize) -> Result<Self, QueueError> {
    Self::with_name(concurrency_limit, DEFAULT_QUEUE_NAME)
  }

  /// Same as [`TaskQueue::new`], with a name that is attached to log events.
  pub fn with_name(concurrency_limit: usize, queue_name: &str) -> Result<Self, QueueError> {
    if concurrency_limit == 0 {
      return Err(QueueError::InvalidArgument(format!(
        "concurrency limit for queue '{}' must be at least 1",
        queue_name
      )));
    }
    info!(%queue_name, concurrency_limit, "Task queue created.");
    Ok(Self {
      shared: Arc::new(QueueShared {
        name: Arc::new(queue_name.to_string()),
        concurrency_limit,
        state: Mutex::new(QueueState {
          next_task_id: 0,
          running: 0,
          pending: VecDeque::new(),
          dispatching: false,
        }),
        idle: Notify::new(),
      }),
    })
  }

  pub fn name(&self) -> &str {
    self.shared.name()
  }

  pub fn concurrency_limit(&self) -> usize {
    self.shared.concurrency_limit
  }

  /// Number of tasks admitted and not yet completed.
  pub fn running(&self) -> usize {
    self.shared.state.lock().running
  }

  /// Number of tasks waiting for a slot.
  pub fn pending(&self) -> usize {
    self.shared.state.lock().pending.len()
  }

  pub fn is_idle(&self) -> bool {
    self.shared.state.lock().is_idle()
  }

  /// Appends `task` to the pending queue and admits whatever fits.
  ///
  /// Never blocks. The task is invoked with its [`CompletionHandle`] as soon as
  /// a slot is free, possibly before this call returns. Its result travels
  /// through whatever the caller wired into the closure.
  ///
  /// The slot is held only while the handle (or a clone of it) is alive.
  /// Dropping it without completing releases the slot at once, so
  /// `submit(|_done| {})` occupies no slot after it returns. A task that
  /// finishes later must move its handle into whatever finishes it.
  pub fn submit<F>(&self, task: F) -> TaskId
  where
    F: FnOnce(CompletionHandle) + Send + 'static,
  {
    let task_id = {
      let mut state = self.shared.state.lock();
      let task_id = state.next_task_id;
      state.next_task_id += 1;
      state.pending.push_back(PendingTask {
        task_id,
        run: Box::new(task),
      });
      debug!(
        queue_name = %self.shared.name,
        %task_id,
        pending = state.pending.len(),
        running = state.running,
        "Task submitted."
      );
      task_id
    };
    self.shared.dispatch();
    task_id
  }

  /// Submits a future and returns a [`TaskHandle`] for its result.
  ///
  /// Once admitted, the future is spawned on the Tokio runtime that was current
  /// when `spawn` was called, and its slot is released when it finishes. If the
  /// handle is cancelled before admission the future is never polled.
  ///
  /// # Errors
  /// Returns `QueueError::NoRuntime` when called outside a Tokio runtime.
  pub fn spawn<F, R>(&self, future: F) -> Result<TaskHandle<R>, QueueError>
  where
    F: Future<Output = R> + Send + 'static,
    R: Send + 'static,
  {
    let runtime = TokioHandle::try_current().map_err(|e| QueueError::NoRuntime(e.to_string()))?;
    let token = CancellationToken::new();
    let (result_tx, result_rx) = oneshot::channel::<Result<R, QueueError>>();

    let task_token = token.clone();
    let queue_name = self.shared.name.clone();

    let task_id = self.submit(move |done: CompletionHandle| {
      let task_id = done.task_id();
      if task_token.is_cancelled() {
        debug!(queue_name = %*queue_name, %task_id, "Task cancelled while pending. Skipping.");
        let _ = result_tx.send(Err(QueueError::TaskCancelled));
        let _ = done.done();
        return;
      }

      let span_queue_name = queue_name.clone();
      runtime.spawn(
        async move {
          let outcome = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(value) => Ok(value),
            Err(_panic_payload) => {
              error!(queue_name = %*queue_name, %task_id, "Task panicked during execution.");
              Err(QueueError::TaskPanicked)
            }
          };
          let panicked = outcome.is_err();
          if result_tx.send(outcome).is_err() {
            warn!(
              queue_name = %*queue_name,
              %task_id,
              "Result receiver for task was dropped. Task outcome may have been lost."
            );
          }
          let _ = if panicked {
            done.fail("task panicked")
          } else {
            done.done()
          };
        }
        .instrument(info_span!("queued_task", queue_name = %*span_queue_name, %task_id)),
      );
    });

    Ok(TaskHandle::new(task_id, token, result_rx))
  }

  /// Waits for a slot and hands it to the caller as a [`CompletionHandle`].
  ///
  /// The caller waits in the same FIFO queue as submitted tasks and holds the
  /// slot until the handle is completed or dropped. Dropping this future before
  /// a slot is granted takes the caller out of the queue.
  ///
  /// # Errors
  /// Returns `QueueError::TaskCancelled` if the waiting entry was removed with
  /// [`TaskQueue::cancel_pending`].
  pub async fn acquire(&self) -> Result<CompletionHandle, QueueError> {
    let (slot_tx, slot_rx) = oneshot::channel::<CompletionHandle>();
    let queue_name = self.shared.name.clone();
    let task_id = self.submit(move |done: CompletionHandle| {
      if let Err(done) = slot_tx.send(done) {
        // The acquirer went away between admission and hand-over.
        trace!(queue_name = %*queue_name, task_id = %done.task_id(), "Acquirer gone. Returning slot.");
        let _ = done.done();
      }
    });

    let mut waiting = WaitingAcquire {
      queue: self,
      task_id,
      granted: false,
    };
    let slot = slot_rx.await;
    waiting.granted = true;

    match slot {
      Ok(done) => {
        trace!(queue_name = %self.shared.name, %task_id, "Slot acquired.");
        Ok(done)
      }
      Err(_) => Err(QueueError::TaskCancelled),
    }
  }

  /// Removes a task that has not been admitted yet.
  ///
  /// Returns `false` if the task is unknown, already running or already finished.
  pub fn cancel_pending(&self, task_id: TaskId) -> bool {
    // The removed task is dropped after the lock is released, its captures may
    // run arbitrary drop code.
    let removed = {
      let mut state = self.shared.state.lock();
      let removed = state
        .pending
        .iter()
        .position(|task| task.task_id == task_id)
        .and_then(|index| state.pending.remove(index));
      if removed.is_some() && state.is_idle() {
        self.shared.idle.notify_waiters();
      }
      removed
    };

    match removed {
      Some(_) => {
        debug!(queue_name = %self.shared.name, %task_id, "Pending task removed before admission.");
        true
      }
      None => false,
    }
  }

  /// Resolves once no task is running and none is pending.
  pub async fn idle(&self) {
    loop {
      let notified = self.shared.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_idle() {
        return;
      }
      notified.await;
    }
  }
}

impl fmt::Debug for TaskQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state.lock();
    f.debug_struct("TaskQueue")
      .field("name", &self.shared.name)
      .field("concurrency_limit", &self.shared.concurrency_limit)
      .field("running", &state.running)
      .field("pending", &state.pending.len())
      .finish()
  }
}

// Leaves the pending queue if an `acquire` call is dropped before it got a slot.
struct WaitingAcquire<'a> {
  queue: &'a TaskQueue,
  task_id: TaskId,
  granted: bool,
}

impl Drop for WaitingAcquire<'_> {
  fn drop(&mut self) {
    if !self.granted && self.queue.cancel_pending(self.task_id) {
      debug!(queue_name = %self.queue.shared.name, task_id = %self.task_id, "Acquire abandoned while waiting.");
    }
  }
}

impl QueueShared {
  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  /// Frees the slot of a completed task and admits the next ones.
  pub(crate) fn release(self: &Arc<Self>, task_id: TaskId) {
    {
      let mut state = self.state.lock();
      debug_assert!(state.running > 0, "slot released with no running task");
      state.running = state.running.saturating_sub(1);
      trace!(
        queue_name = %self.name,
        %task_id,
        running = state.running,
        pending = state.pending.len(),
        "Slot released."
      );
    }
    self.dispatch();
  }

  /// Admits pending tasks until the limit is reached or the queue is empty.
  ///
  /// Only one caller runs this loop at a time. Re-entrant calls, including a
  /// task completing synchronously from inside its own invocation, return
  /// immediately and are picked up by the next iteration of the active loop,
  /// so long completion chains never deepen the stack.
  fn dispatch(self: &Arc<Self>) {
    {
      let mut state = self.state.lock();
      if state.dispatching {
        return;
      }
      state.dispatching = true;
    }

    loop {
      let admitted: Vec<PendingTask> = {
        let mut state = self.state.lock();
        let mut batch = Vec::new();
        while state.running < self.concurrency_limit {
          match state.pending.pop_front() {
            Some(task) => {
              state.running += 1;
              batch.push(task);
            }
            None => break,
          }
        }

        if batch.is_empty() {
          state.dispatching = false;
          trace!(
            queue_name = %self.name,
            running = state.running,
            pending = state.pending.len(),
            "Dispatch reached a fixed point."
          );
          if state.is_idle() {
            self.idle.notify_waiters();
          }
          return;
        }
        batch
      };

      for task in admitted {
        let task_id = task.task_id;
        let handle = CompletionHandle::new(task_id, Arc::clone(self));
        let run = task.run;
        debug!(queue_name = %self.name, %task_id, "Admitting task.");
        // A panicking task drops its handle while unwinding, which frees the slot.
        if catch_unwind(AssertUnwindSafe(move || run(handle))).is_err() {
          error!(queue_name = %self.name, %task_id, "Task panicked while being admitted.");
        }
      }
    }
  }
}
