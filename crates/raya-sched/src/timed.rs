//! Timed tasks
//!
//! A timed task runs its action exactly like a plain task while the shared
//! watchdog thread polls a pausable stopwatch. Once the elapsed time exceeds the
//! timeout, the timeout callback is invoked once. The action itself is never
//! interrupted; the callback is only a notification the caller can use to
//! request cooperative cancellation (e.g. ask the engine to terminate the
//! running script).
//!
//! Time spent in break state is excluded: the scheduler calls `on_break` and
//! `on_resume`, which pause and restart the stopwatch. Breaks nest, and the
//! stopwatch restarts only when the outermost one ends.

use crate::awaiter::Awaiter;
use crate::scheduler::Scheduler;
use crate::task::{Runnable, Task, TaskId, TaskPriority, TaskState};
use crate::watchdog::{TimeoutCallback, Watchdog};
use crate::{TaskError, TaskResult};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Default interval between timeout checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pausable elapsed-time tracker
#[derive(Debug, Default, Clone, Copy)]
pub struct Stopwatch {
    /// Time accumulated by completed start/stop intervals
    accumulated: Duration,

    /// Start of the current interval, if running
    started: Option<Instant>,
}

impl Stopwatch {
    /// Create a stopped stopwatch at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or resume) measuring; no-op if already running
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Stop measuring, keeping the accumulated time
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    /// Whether the stopwatch is running
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Total measured time
    pub fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => self.accumulated + started.elapsed(),
            None => self.accumulated,
        }
    }
}

/// A task that reports when its action runs longer than a timeout
pub struct TimedTask<T> {
    /// Wrapped task
    task: Arc<Task<T>>,

    /// Execution budget, excluding time spent in break state
    timeout: Duration,

    /// Watchdog polling interval
    poll_interval: Duration,

    /// Timeout notification, taken when fired
    on_timeout: Arc<Mutex<Option<TimeoutCallback>>>,

    /// Execution time tracker
    stopwatch: Arc<Mutex<Stopwatch>>,

    /// Depth of break states entered while this task runs
    breaks: Mutex<usize>,
}

impl<T: Send + 'static> TimedTask<T> {
    /// Create a timed task from an infallible closure, at `Lowest` priority
    pub fn new<F, C>(f: F, on_timeout: C, timeout: Duration) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self::wrap(Task::new(f), on_timeout, timeout)
    }

    /// Create a timed task from a closure that may fail, at `Lowest` priority
    pub fn fallible<F, C>(f: F, on_timeout: C, timeout: Duration) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self::wrap(Task::fallible(f), on_timeout, timeout)
    }

    fn wrap<C>(task: Task<T>, on_timeout: C, timeout: Duration) -> Self
    where
        C: FnOnce() + Send + 'static,
    {
        Self {
            task: Arc::new(task),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            on_timeout: Arc::new(Mutex::new(Some(Box::new(on_timeout)))),
            stopwatch: Arc::new(Mutex::new(Stopwatch::new())),
            breaks: Mutex::new(0),
        }
    }

    /// Set the priority (before the task is shared)
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        if let Some(task) = Arc::get_mut(&mut self.task) {
            task.set_priority(priority);
        }
        self
    }

    /// Override the watchdog polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Queue this task on the scheduler's main queue
    pub fn start(self: &Arc<Self>, scheduler: Arc<dyn Scheduler>) -> TaskResult<Arc<Self>> {
        self.task.schedule(self.clone(), scheduler, false)?;
        Ok(self.clone())
    }

    /// Queue this task on the scheduler's debug queue
    pub fn start_debug(self: &Arc<Self>, scheduler: Arc<dyn Scheduler>) -> TaskResult<Arc<Self>> {
        self.task.schedule(self.clone(), scheduler, true)?;
        Ok(self.clone())
    }

    /// Execute the task on the calling thread, watching for the timeout
    pub fn run(&self) -> TaskResult<()> {
        match self.task.state() {
            TaskState::Complete | TaskState::Failed => return Err(TaskError::AlreadyComplete),
            TaskState::Running => return Err(TaskError::AlreadyRunning),
            TaskState::Initialized | TaskState::Pending => {}
        }

        let watch = match Watchdog::global() {
            Ok(watchdog) => Some(watchdog.watch(
                self.task.id(),
                self.timeout,
                self.poll_interval,
                self.stopwatch.clone(),
                self.on_timeout.clone(),
            )),
            Err(error) => {
                warn!(
                    task = %self.task.id(),
                    "failed to start timeout watchdog, running untimed: {}",
                    error
                );
                None
            }
        };
        self.stopwatch.lock().start();

        let outcome = self.task.run();

        // Unwatch first so a finished task can no longer time out
        drop(watch);
        self.stopwatch.lock().stop();

        outcome
    }

    /// An awaiter over the wrapped task
    pub fn get_awaiter(&self) -> TaskResult<Awaiter<T>> {
        self.task.get_awaiter()
    }

    /// Execution budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time measured against the budget so far
    pub fn elapsed(&self) -> Duration {
        self.stopwatch.lock().elapsed()
    }

    /// Whether the timeout callback has been invoked
    pub fn timed_out(&self) -> bool {
        self.on_timeout.lock().is_none()
    }
}

impl<T> Deref for TimedTask<T> {
    type Target = Task<T>;

    fn deref(&self) -> &Task<T> {
        &self.task
    }
}

impl<T: Send + 'static> Runnable for TimedTask<T> {
    fn id(&self) -> TaskId {
        self.task.id()
    }

    fn name(&self) -> Option<String> {
        self.task.name()
    }

    fn priority(&self) -> TaskPriority {
        self.task.priority()
    }

    fn state(&self) -> TaskState {
        self.task.state()
    }

    fn run(&self) -> TaskResult<()> {
        TimedTask::run(self)
    }

    fn on_break(&self) {
        let mut breaks = self.breaks.lock();
        *breaks += 1;
        self.stopwatch.lock().stop();
    }

    fn on_resume(&self) {
        let mut breaks = self.breaks.lock();
        *breaks = breaks.saturating_sub(1);
        // A fired timeout stays fired
        if *breaks == 0 && !self.timed_out() {
            self.stopwatch.lock().start();
        }
    }

    fn abandon(&self, reason: TaskError) {
        Runnable::abandon(&*self.task, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_stopwatch_pause_resume() {
        let mut stopwatch = Stopwatch::new();
        assert!(!stopwatch.is_running());
        assert_eq!(stopwatch.elapsed(), Duration::ZERO);

        stopwatch.start();
        thread::sleep(Duration::from_millis(10));
        stopwatch.stop();
        let first = stopwatch.elapsed();
        assert!(first >= Duration::from_millis(10));

        // Paused time is not counted
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stopwatch.elapsed(), first);

        stopwatch.start();
        thread::sleep(Duration::from_millis(5));
        assert!(stopwatch.elapsed() >= first + Duration::from_millis(5));
    }

    #[test]
    fn test_timeout_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = TimedTask::new(
            || {
                thread::sleep(Duration::from_millis(80));
                "finished"
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(20),
        );

        task.run().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.timed_out());
        // Timing out does not alter the outcome
        assert_eq!(task.state(), TaskState::Complete);
        assert_eq!(task.result(), Some("finished"));
    }

    #[test]
    fn test_fast_task_does_not_time_out() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = TimedTask::new(
            || 1,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(5),
        );

        task.run().unwrap();
        thread::sleep(Duration::from_millis(30));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!task.timed_out());
        assert!(task.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_does_not_mask_failure() {
        let task = TimedTask::<()>::fallible(
            || {
                thread::sleep(Duration::from_millis(50));
                anyhow::bail!("script threw")
            },
            || {},
            Duration::from_millis(10),
        )
        .with_poll_interval(Duration::from_millis(2));

        assert!(matches!(task.run(), Err(TaskError::Failed(_))));
        assert!(task.timed_out());
        assert_eq!(task.state(), TaskState::Failed);
        assert!(matches!(task.run(), Err(TaskError::AlreadyComplete)));
    }

    #[test]
    fn test_break_pauses_budget() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = Arc::new(TimedTask::new(
            || (),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(30),
        ));

        task.stopwatch.lock().start();
        Runnable::on_break(&*task);
        assert!(!task.stopwatch.lock().is_running());
        thread::sleep(Duration::from_millis(40));
        assert!(task.elapsed() < Duration::from_millis(30));

        Runnable::on_resume(&*task);
        assert!(task.stopwatch.lock().is_running());
    }

    #[test]
    fn test_nested_breaks_resume_once() {
        let task = TimedTask::new(|| (), || {}, Duration::from_secs(1));
        task.stopwatch.lock().start();

        Runnable::on_break(&task);
        Runnable::on_break(&task);
        Runnable::on_resume(&task);
        assert!(!task.stopwatch.lock().is_running());

        Runnable::on_resume(&task);
        assert!(task.stopwatch.lock().is_running());
    }

    #[test]
    fn test_priority_and_awaiter() {
        let task = TimedTask::new(|| 7, || {}, Duration::from_secs(1))
            .with_priority(TaskPriority::Execution);
        assert_eq!(task.priority(), TaskPriority::Execution);
        assert!(matches!(task.get_awaiter(), Err(TaskError::Unscheduled)));
    }
}
