use crate::error::QueueError;
use crate::queue::QueueShared;
use crate::task::{TaskError, TaskId};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

/// The exactly-once signal an admitted task uses to release its slot.
///
/// Cloning is cheap and all clones share one completion state, so a task can
/// move the handle into whichever callback or spawned future finishes its work.
/// The first `complete` across all clones frees the slot and lets the next
/// pending task in; any further call is rejected with `QueueError::LogicError`.
///
/// Dropping the last clone without completing also frees the slot. A task that
/// has to hold its slot must therefore keep its handle alive.
#[derive(Clone)]
pub struct CompletionHandle {
  inner: Arc<CompletionInner>,
}

struct CompletionInner {
  task_id: TaskId,
  completed: AtomicBool,
  queue: Arc<QueueShared>,
}

impl CompletionHandle {
  pub(crate) fn new(task_id: TaskId, queue: Arc<QueueShared>) -> Self {
    Self {
      inner: Arc::new(CompletionInner {
        task_id,
        completed: AtomicBool::new(false),
        queue,
      }),
    }
  }

  /// Returns the ID of the task this handle belongs to.
  pub fn task_id(&self) -> TaskId {
    self.inner.task_id
  }

  /// Returns `true` once the task has signalled completion (or its handle was dropped).
  pub fn is_completed(&self) -> bool {
    self.inner.completed.load(Ordering::Acquire)
  }

  /// Signals that the task has finished, successfully or with an error.
  ///
  /// The error payload belongs to the caller's own result plumbing; the queue
  /// only uses the signal to free the slot.
  ///
  /// # Errors
  /// Returns `QueueError::LogicError` if this task already completed. In that
  /// case nothing is released a second time.
  pub fn complete(&self, outcome: Result<(), TaskError>) -> Result<(), QueueError> {
    if self.inner.completed.swap(true, Ordering::AcqRel) {
      warn!(
        queue_name = %self.inner.queue.name(),
        task_id = %self.inner.task_id,
        "Completion handle invoked more than once. Ignoring."
      );
      return Err(QueueError::LogicError(format!(
        "completion handle for task {} invoked more than once",
        self.inner.task_id
      )));
    }
    trace!(
      queue_name = %self.inner.queue.name(),
      task_id = %self.inner.task_id,
      failed = outcome.is_err(),
      "Task signalled completion."
    );
    self.inner.queue.release(self.inner.task_id);
    Ok(())
  }

  /// Shorthand for `complete(Ok(()))`.
  pub fn done(&self) -> Result<(), QueueError> {
    self.complete(Ok(()))
  }

  /// Shorthand for `complete(Err(err))`.
  pub fn fail(&self, err: impl Into<TaskError>) -> Result<(), QueueError> {
    self.complete(Err(err.into()))
  }
}

impl fmt::Debug for CompletionHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionHandle")
      .field("task_id", &self.inner.task_id)
      .field("completed", &self.is_completed())
      .finish_non_exhaustive()
  }
}

impl Drop for CompletionInner {
  fn drop(&mut self) {
    if !self.completed.swap(true, Ordering::AcqRel) {
      warn!(
        queue_name = %self.queue.name(),
        task_id = %self.task_id,
        "Completion handle dropped without completing. Releasing its slot."
      );
      self.queue.release(self.task_id);
    }
  }
}
