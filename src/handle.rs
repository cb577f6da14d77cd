use crate::error::QueueError;
use crate::task::TaskId;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing;

/// A handle to a future submitted through `TaskQueue::spawn` or `WorkerPool::submit`.
///
/// Allows for cancelling the task before it is admitted and awaiting its result.
#[derive(Debug)]
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: TaskId,
  pub(crate) cancellation_token: CancellationToken,
  pub(crate) result_receiver: oneshot::Receiver<Result<R, QueueError>>,
}

impl<R: Send + 'static> TaskHandle<R> {
  pub(crate) fn new(
    task_id: TaskId,
    cancellation_token: CancellationToken,
    result_receiver: oneshot::Receiver<Result<R, QueueError>>,
  ) -> Self {
    Self {
      task_id,
      cancellation_token,
      result_receiver,
    }
  }

  /// Returns the ID of this task.
  pub fn id(&self) -> TaskId {
    self.task_id
  }

  /// Checks if cancellation has been requested for this task.
  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation_token.is_cancelled()
  }

  /// Requests that this task is never started.
  ///
  /// Only effective while the task is still pending. A task that was already
  /// admitted runs to completion and its result is delivered as usual.
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.task_id, "TaskHandle: Cancellation requested.");
    self.cancellation_token.cancel();
  }

  /// Awaits the completion of the task and returns its result of type `R`.
  ///
  /// # Errors
  /// Returns `QueueError::TaskPanicked` if the task panicked during execution.
  /// Returns `QueueError::TaskCancelled` if the task was cancelled before it started,
  /// or aborted by a forceful pool shutdown.
  /// Returns `QueueError::QueueShuttingDown` if the pool shut down before running the task.
  /// Returns `QueueError::ResultChannelError` if the result sender was dropped without a value.
  pub async fn await_result(self) -> Result<R, QueueError> {
    match self.result_receiver.await {
      Ok(task_outcome) => task_outcome,
      Err(recv_error) => {
        if self.cancellation_token.is_cancelled() {
          return Err(QueueError::TaskCancelled);
        }
        tracing::warn!(task_id = %self.task_id, "Result channel receive error: {}", recv_error);
        Err(QueueError::ResultChannelError(format!(
          "Task (id: {}) result channel unexpectedly closed: {}",
          self.task_id, recv_error
        )))
      }
    }
  }
}
