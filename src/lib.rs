//! A bounded-concurrency task queue: at most `concurrency_limit` tasks run at
//! once, the rest wait in FIFO order and are admitted as slots free up.
//!
//! Two equivalent flavours are provided. [`TaskQueue`] is push-based: every
//! submit and every completion runs a dispatch step, and each admitted task
//! reports back through an exactly-once [`CompletionHandle`]. [`WorkerPool`] is
//! pull-based: a fixed set of Tokio workers pull tasks from a shared channel.

mod completion;
mod error;
mod handle;
mod pool;
mod queue;
mod task;

pub use completion::CompletionHandle;
pub use error::QueueError;
pub use handle::TaskHandle;
pub use pool::{ShutdownMode, WorkerPool};
pub use queue::TaskQueue;
pub use task::{TaskError, TaskId, TaskToExecute};
