//! Raya Task Scheduler
//!
//! This crate serializes access to a thread-affine resource (an embedded
//! engine context) from any number of calling threads:
//! - Tasks with priorities, lifecycle states and completion callbacks
//! - Timed tasks that report (but never abort) long-running work
//! - Awaiters that expose a task as a `Future`
//! - A priority-FIFO scheduler owning a single worker thread, with a nested
//!   break (debugger) mode serviced from a second queue
//! - A scheduled runtime wrapper that keeps a resource on the worker thread
//!
//! # Example
//!
//! ```rust,ignore
//! use raya_sched::{PfifoScheduler, SchedulerExt, TaskPriority};
//!
//! let scheduler = PfifoScheduler::new()?;
//! let task = scheduler.run(|| 40 + 2, TaskPriority::Execution)?;
//! task.wait()?;
//! assert_eq!(task.result(), Some(42));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod awaiter;
pub mod pfifo;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod timed;
mod watchdog;

pub use awaiter::Awaiter;
pub use pfifo::{PfifoScheduler, SchedulerOptions, SchedulerStats};
pub use queue::TaskQueue;
pub use runtime::ScheduledRuntime;
pub use scheduler::{Scheduler, SchedulerExt};
pub use task::{Runnable, Task, TaskId, TaskPriority, TaskState};
pub use timed::{Stopwatch, TimedTask, DEFAULT_POLL_INTERVAL};

use std::sync::Arc;

/// Scheduler and task errors
///
/// Everything except `Failed` and `Panicked` is a usage error reported
/// synchronously at the call site.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Task was already handed to a scheduler
    #[error("Task is already scheduled for execution")]
    AlreadyScheduled,

    /// Task already ran to completion (or failure)
    #[error("Task is already complete")]
    AlreadyComplete,

    /// Task is executing further up the current call stack
    #[error("Task is already running")]
    AlreadyRunning,

    /// Task was never started on a scheduler, so it will never run
    #[error("Task is unscheduled; call start() before waiting on it")]
    Unscheduled,

    /// Debug task queued while the scheduler is not in break state
    #[error("Can't queue a debug task on a scheduler that is not in break state")]
    NotInBreakState,

    /// Scheduler was disposed
    #[error("Scheduler has been disposed")]
    Disposed,

    /// Operation restricted to the scheduler's worker thread
    #[error("Current thread is not the scheduler's worker thread")]
    WrongThread,

    /// The task's result was already moved out
    #[error("Task result was already taken")]
    ResultTaken,

    /// The task's action returned an error
    #[error("Task failed: {0:#}")]
    Failed(Arc<anyhow::Error>),

    /// The task's action panicked
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(Arc<std::io::Error>),
}

impl TaskError {
    /// Whether this error was raised by the task's own action
    pub fn is_execution_error(&self) -> bool {
        matches!(self, TaskError::Failed(_) | TaskError::Panicked(_))
    }
}

/// Scheduler operation result
pub type TaskResult<T> = Result<T, TaskError>;
