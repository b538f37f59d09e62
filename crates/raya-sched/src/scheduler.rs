//! Scheduler contract
//!
//! A scheduler owns the queues a task is handed to and decides which thread
//! may execute it. [`PfifoScheduler`](crate::PfifoScheduler) is the
//! production implementation; tests substitute schedulers that run nothing
//! or run everything inline.

use crate::task::{Runnable, Task, TaskPriority};
use crate::timed::TimedTask;
use crate::TaskResult;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

/// Queueing, break-state and thread-affinity contract
pub trait Scheduler: Send + Sync {
    /// Add a task to the main queue
    ///
    /// Use [`Task::start`] rather than calling this directly.
    fn queue_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()>;

    /// Add a task to the debug queue
    ///
    /// Fails unless the scheduler is in break state, since the task would
    /// otherwise never run.
    fn queue_debug_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()>;

    /// Service the debug queue on the current thread until
    /// [`exit_break_state`](Scheduler::exit_break_state) is called
    fn enter_break_state(&self) -> TaskResult<()>;

    /// Signal a scheduler in break state to return to normal execution
    fn exit_break_state(&self);

    /// Whether tasks may execute on the calling thread
    fn can_execute_in_this_thread(&self) -> bool;

    /// Task currently executing on the worker, when called from the worker
    fn current_task(&self) -> Option<Arc<dyn Runnable>> {
        None
    }

    /// The one thread that executes this scheduler's tasks, if fixed
    ///
    /// Recorded by every task bound to this scheduler.
    fn worker_thread(&self) -> Option<ThreadId> {
        None
    }

    /// Execute a queued task right away on the worker thread, outside queue
    /// order (a re-entrant wait)
    fn run_inline(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
        task.run()
    }

    /// Stop accepting tasks and let the worker retire
    fn dispose(&self) {}
}

/// Convenience constructors that create a task and start it
///
/// Implemented for every `Arc` of a concrete scheduler.
pub trait SchedulerExt {
    /// This scheduler as a shared trait object
    fn scheduler_ref(&self) -> Arc<dyn Scheduler>;

    /// Create and start a task
    fn run<T, F>(&self, f: F, priority: TaskPriority) -> TaskResult<Arc<Task<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Arc::new(Task::new(f).with_priority(priority)).start(self.scheduler_ref())
    }

    /// Create and start a task whose action may fail
    fn try_run<T, F>(&self, f: F, priority: TaskPriority) -> TaskResult<Arc<Task<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Arc::new(Task::fallible(f).with_priority(priority)).start(self.scheduler_ref())
    }

    /// Create and start a timed task
    fn run_timed<T, F, C>(
        &self,
        f: F,
        on_timeout: C,
        timeout: Duration,
        priority: TaskPriority,
    ) -> TaskResult<Arc<TimedTask<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Arc::new(TimedTask::new(f, on_timeout, timeout).with_priority(priority))
            .start(self.scheduler_ref())
    }

    /// Create and start a timed task whose action may fail
    fn try_run_timed<T, F, C>(
        &self,
        f: F,
        on_timeout: C,
        timeout: Duration,
        priority: TaskPriority,
    ) -> TaskResult<Arc<TimedTask<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Arc::new(TimedTask::fallible(f, on_timeout, timeout).with_priority(priority))
            .start(self.scheduler_ref())
    }

    /// Create and start a task on the debug queue
    fn run_debug<T, F>(&self, f: F, priority: TaskPriority) -> TaskResult<Arc<Task<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Arc::new(Task::new(f).with_priority(priority)).start_debug(self.scheduler_ref())
    }

    /// Create and start a task on the debug queue whose action may fail
    fn try_run_debug<T, F>(&self, f: F, priority: TaskPriority) -> TaskResult<Arc<Task<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Arc::new(Task::fallible(f).with_priority(priority)).start_debug(self.scheduler_ref())
    }

    /// Create and start a timed task on the debug queue
    fn run_debug_timed<T, F, C>(
        &self,
        f: F,
        on_timeout: C,
        timeout: Duration,
        priority: TaskPriority,
    ) -> TaskResult<Arc<TimedTask<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Arc::new(TimedTask::new(f, on_timeout, timeout).with_priority(priority))
            .start_debug(self.scheduler_ref())
    }

    /// Create and start a timed task on the debug queue whose action may fail
    fn try_run_debug_timed<T, F, C>(
        &self,
        f: F,
        on_timeout: C,
        timeout: Duration,
        priority: TaskPriority,
    ) -> TaskResult<Arc<TimedTask<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Arc::new(TimedTask::fallible(f, on_timeout, timeout).with_priority(priority))
            .start_debug(self.scheduler_ref())
    }
}

impl<S: Scheduler + 'static> SchedulerExt for Arc<S> {
    fn scheduler_ref(&self) -> Arc<dyn Scheduler> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use crate::TaskError;
    use parking_lot::Mutex;

    /// Runs every task synchronously as soon as it is queued
    #[derive(Default)]
    struct InlineScheduler {
        in_break: Mutex<bool>,
    }

    impl Scheduler for InlineScheduler {
        fn queue_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
            let _ = task.run();
            Ok(())
        }

        fn queue_debug_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
            if !*self.in_break.lock() {
                return Err(TaskError::NotInBreakState);
            }
            self.queue_task(task)
        }

        fn enter_break_state(&self) -> TaskResult<()> {
            *self.in_break.lock() = true;
            Ok(())
        }

        fn exit_break_state(&self) {
            *self.in_break.lock() = false;
        }

        fn can_execute_in_this_thread(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_run_helpers() {
        let scheduler = Arc::new(InlineScheduler::default());

        let plain = scheduler.run(|| (), TaskPriority::Lowest).unwrap();
        assert_eq!(plain.state(), TaskState::Complete);

        let valued = scheduler.run(|| 3 * 7, TaskPriority::Execution).unwrap();
        assert_eq!(valued.priority(), TaskPriority::Execution);
        assert_eq!(valued.result(), Some(21));

        let failing = scheduler
            .try_run::<(), _>(|| anyhow::bail!("nope"), TaskPriority::Callback)
            .unwrap();
        assert_eq!(failing.state(), TaskState::Failed);
        assert!(matches!(failing.wait(), Err(TaskError::Failed(_))));
    }

    #[test]
    fn test_timed_helpers() {
        let scheduler = Arc::new(InlineScheduler::default());

        let timed = scheduler
            .run_timed(|| 1, || {}, Duration::from_secs(5), TaskPriority::Promise)
            .unwrap();
        assert_eq!(timed.priority(), TaskPriority::Promise);
        assert_eq!(timed.result(), Some(1));

        let failing = scheduler
            .try_run_timed::<(), _, _>(
                || anyhow::bail!("late"),
                || {},
                Duration::from_secs(5),
                TaskPriority::Lowest,
            )
            .unwrap();
        assert_eq!(failing.state(), TaskState::Failed);
    }

    #[test]
    fn test_debug_helpers_require_break_state() {
        let scheduler = Arc::new(InlineScheduler::default());

        let err = scheduler.run_debug(|| (), TaskPriority::Lowest).unwrap_err();
        assert!(matches!(err, TaskError::NotInBreakState));

        scheduler.enter_break_state().unwrap();
        let task = scheduler.run_debug(|| 2, TaskPriority::Lowest).unwrap();
        assert_eq!(task.result(), Some(2));

        let timed = scheduler
            .run_debug_timed(|| 3, || {}, Duration::from_secs(1), TaskPriority::Lowest)
            .unwrap();
        assert_eq!(timed.result(), Some(3));

        let failing = scheduler
            .try_run_debug::<(), _>(|| anyhow::bail!("eval failed"), TaskPriority::Lowest)
            .unwrap();
        assert!(matches!(failing.wait(), Err(TaskError::Failed(_))));

        let checked = scheduler
            .try_run_debug_timed(
                || Ok("inspected"),
                || {},
                Duration::from_secs(1),
                TaskPriority::Callback,
            )
            .unwrap();
        assert_eq!(checked.priority(), TaskPriority::Callback);
        assert_eq!(checked.result(), Some("inspected"));
        scheduler.exit_break_state();

        assert!(scheduler.run_debug(|| (), TaskPriority::Lowest).is_err());
    }

    #[test]
    fn test_default_hooks() {
        let scheduler = InlineScheduler::default();
        assert!(scheduler.current_task().is_none());
        assert!(scheduler.worker_thread().is_none());
        scheduler.dispose();
    }
}
