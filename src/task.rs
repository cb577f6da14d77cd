use std::future::Future;
use std::pin::Pin;

/// Identifier of a submitted task, unique within one queue or pool.
pub type TaskId = u64;

/// The opaque error a task may report through its completion handle.
/// The queue never inspects it.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The type of future that the worker pool executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// A callback-style task waiting in the pending queue of a `TaskQueue`.
pub(crate) struct PendingTask {
  pub(crate) task_id: TaskId,
  pub(crate) run: Box<dyn FnOnce(crate::CompletionHandle) + Send + 'static>,
}
