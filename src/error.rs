use thiserror::Error;

/// Errors that can occur within a `TaskQueue` or `WorkerPool`.
#[derive(Error, Debug, PartialEq)]
pub enum QueueError {
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Logic error: {0}")]
  LogicError(String),

  #[error("Task result channel error (sender dropped before a result was sent): {0}")]
  ResultChannelError(String),

  #[error("Submitted task future panicked")]
  TaskPanicked,

  #[error("Task was cancelled")]
  TaskCancelled,

  #[error("Pool is shutting down or already shut down, task was not run")]
  QueueShuttingDown,

  #[error("No Tokio runtime available to spawn the task on: {0}")]
  NoRuntime(String),
}
