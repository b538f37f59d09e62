//! Task structure and execution state

use crate::awaiter::Awaiter;
use crate::scheduler::Scheduler;
use crate::{TaskError, TaskResult};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Priority of task execution
///
/// Declaration order is precedence: `Initialization` always runs before
/// `Execution`, and so on down to `Lowest`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskPriority {
    /// Engine/context initialization work
    Initialization,
    /// Script execution requested by the host
    Execution,
    /// Callbacks from the engine into the host
    Callback,
    /// Promise continuations
    Promise,
    /// Everything else
    #[default]
    Lowest,
}

impl TaskPriority {
    /// Number of priority levels
    pub const COUNT: usize = 5;

    /// All levels, highest precedence first
    pub const ALL: [TaskPriority; Self::COUNT] = [
        TaskPriority::Initialization,
        TaskPriority::Execution,
        TaskPriority::Callback,
        TaskPriority::Promise,
        TaskPriority::Lowest,
    ];

    /// Ordinal of this level (0 = highest precedence)
    pub fn index(self) -> usize {
        self as usize
    }
}

/// State of a Task
///
/// Transitions only move forward:
/// `Initialized -> Pending -> Running -> Complete | Failed`.
/// A pending task may also go straight to `Failed` when it is abandoned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// Created, not yet handed to a scheduler
    Initialized,
    /// Queued on a scheduler
    Pending,
    /// Currently executing
    Running,
    /// Action returned normally
    Complete,
    /// Action failed, panicked, or the task was abandoned
    Failed,
}

impl TaskState {
    /// Whether the task has finished (successfully or not)
    pub fn is_completed(self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }
}

/// Type-erased view of a task, as held by scheduler queues
pub trait Runnable: Send + Sync {
    /// Task identifier
    fn id(&self) -> TaskId;

    /// Optional human-readable name
    fn name(&self) -> Option<String>;

    /// Scheduling priority
    fn priority(&self) -> TaskPriority;

    /// Current lifecycle state
    fn state(&self) -> TaskState;

    /// Execute the task on the calling thread
    fn run(&self) -> TaskResult<()>;

    /// The worker entered break state while this task was executing
    fn on_break(&self) {}

    /// The worker left break state and is returning to this task
    fn on_resume(&self) {}

    /// Fail a task that will never run (e.g. its scheduler shut down)
    fn abandon(&self, reason: TaskError);
}

type Action<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;
type Callback = Box<dyn FnOnce() + Send>;

/// Where a task was scheduled, set exactly once
struct Binding {
    /// Scheduler that owns the queue entry (not kept alive by the task)
    scheduler: Weak<dyn Scheduler>,

    /// The queued runnable; differs from the task itself for decorated tasks
    runnable: Weak<dyn Runnable>,

    /// Worker thread of the scheduler, recorded so that it outlives the
    /// scheduler handle
    worker: Option<ThreadId>,
}

/// Where a waiter stands relative to the task's scheduler
enum Affinity {
    /// On the worker thread of a live scheduler
    Worker(Arc<dyn Scheduler>),
    /// On the worker thread of a scheduler that has been dropped
    Orphaned,
    /// Any other thread
    Elsewhere,
}

impl Binding {
    fn affinity(&self) -> Affinity {
        match self.scheduler.upgrade() {
            Some(scheduler) if scheduler.can_execute_in_this_thread() => Affinity::Worker(scheduler),
            Some(_) => Affinity::Elsewhere,
            None if self.worker == Some(thread::current().id()) => Affinity::Orphaned,
            None => Affinity::Elsewhere,
        }
    }
}

/// Completion flag and callbacks, guarded together so that a callback is
/// either queued before completion or run immediately, never lost
struct Completion {
    done: bool,
    callbacks: Vec<Callback>,
}

/// A unit of deferred work bound to a single-threaded scheduler
pub struct Task<T> {
    /// Unique identifier
    id: TaskId,

    /// Scheduling priority
    priority: TaskPriority,

    /// Optional name for diagnostics
    name: Mutex<Option<String>>,

    /// Current state
    state: Mutex<TaskState>,

    /// Work to perform, taken on first run
    action: Mutex<Option<Action<T>>>,

    /// Result value (if completed)
    result: Mutex<Option<T>>,

    /// Error the task failed with
    failure: Mutex<Option<TaskError>>,

    /// Scheduler binding
    binding: OnceCell<Binding>,

    /// Completion tracking for blocking wait and callbacks
    completion: Mutex<Completion>,

    /// Condvar for blocking until task completes
    completion_condvar: Condvar,
}

impl<T: Send + 'static> Task<T> {
    /// Create a task from an infallible closure, at `Lowest` priority
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::fallible(move || Ok(f()))
    }

    /// Create a task from a closure that may fail, at `Lowest` priority
    pub fn fallible<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            id: TaskId::new(),
            priority: TaskPriority::default(),
            name: Mutex::new(None),
            state: Mutex::new(TaskState::Initialized),
            action: Mutex::new(Some(Box::new(f))),
            result: Mutex::new(None),
            failure: Mutex::new(None),
            binding: OnceCell::new(),
            completion: Mutex::new(Completion {
                done: false,
                callbacks: Vec::new(),
            }),
            completion_condvar: Condvar::new(),
        }
    }

    /// Set the priority (before the task is shared)
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn set_priority(&mut self, priority: TaskPriority) {
        self.priority = priority;
    }

    /// Queue this task on the scheduler's main queue
    pub fn start(self: &Arc<Self>, scheduler: Arc<dyn Scheduler>) -> TaskResult<Arc<Self>> {
        self.schedule(self.clone(), scheduler, false)?;
        Ok(self.clone())
    }

    /// Queue this task on the scheduler's debug queue
    ///
    /// Only valid while the scheduler is in break state.
    pub fn start_debug(self: &Arc<Self>, scheduler: Arc<dyn Scheduler>) -> TaskResult<Arc<Self>> {
        self.schedule(self.clone(), scheduler, true)?;
        Ok(self.clone())
    }
}

impl<T> Task<T> {
    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the priority
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Whether the task has finished (successfully or not)
    pub fn is_completed(&self) -> bool {
        self.state().is_completed()
    }

    /// Whether the task was handed to a scheduler
    pub fn is_scheduled(&self) -> bool {
        self.binding.get().is_some()
    }

    /// Get the task name
    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    /// Set the task name
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }

    /// Set the task name, for chaining after `start`
    pub fn with_name(self: Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        self.set_name(name);
        self
    }

    /// The error this task failed with, if any
    pub fn failure(&self) -> Option<TaskError> {
        self.failure.lock().clone()
    }

    /// Move the result out of the task
    pub fn take_result(&self) -> Option<T> {
        self.result.lock().take()
    }

    /// Register a callback to run once the task finishes
    ///
    /// Callbacks run in registration order on the thread that finishes the
    /// task. If the task already finished, the callback runs immediately on
    /// the calling thread.
    pub fn on_completed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut completion = self.completion.lock();
        if completion.done {
            drop(completion);
            callback();
            return;
        }
        completion.callbacks.push(Box::new(callback));
    }

    /// Execute the task on the calling thread
    ///
    /// The action runs at most once. An error or panic raised by the action
    /// marks the task `Failed` and is returned to the caller.
    pub fn run(&self) -> TaskResult<()> {
        let action = {
            let mut state = self.state.lock();
            match *state {
                TaskState::Complete | TaskState::Failed => return Err(TaskError::AlreadyComplete),
                TaskState::Running => return Err(TaskError::AlreadyRunning),
                TaskState::Initialized | TaskState::Pending => {}
            }
            let Some(action) = self.action.lock().take() else {
                return Err(TaskError::AlreadyComplete);
            };
            *state = TaskState::Running;
            action
        };

        trace!(task = %self.id, priority = ?self.priority, "task running");

        let outcome = match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(value)) => {
                *self.result.lock() = Some(value);
                Ok(())
            }
            Ok(Err(error)) => Err(TaskError::Failed(Arc::new(error))),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };

        self.finish(outcome.as_ref().err().cloned());
        outcome
    }

    /// Block until the task finishes
    ///
    /// On the scheduler's own worker thread the task is executed inline
    /// instead, so a task can wait on work queued behind it.
    pub fn wait(&self) -> TaskResult<()> {
        let binding = self.binding.get().ok_or(TaskError::Unscheduled)?;

        if !self.is_completed() {
            match binding.affinity() {
                Affinity::Worker(scheduler) => self.run_inline(binding, scheduler.as_ref())?,
                Affinity::Orphaned => self.abandon_orphaned()?,
                Affinity::Elsewhere => {
                    let mut completion = self.completion.lock();
                    while !completion.done {
                        self.completion_condvar.wait(&mut completion);
                    }
                }
            }
        }

        self.outcome()
    }

    /// Block until the task finishes or `timeout` elapses
    ///
    /// Returns whether completion was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> TaskResult<bool> {
        let binding = self.binding.get().ok_or(TaskError::Unscheduled)?;

        if self.is_completed() {
            return self.outcome().map(|()| true);
        }
        match binding.affinity() {
            Affinity::Worker(scheduler) => {
                self.run_inline(binding, scheduler.as_ref())?;
                return self.outcome().map(|()| true);
            }
            Affinity::Orphaned => {
                self.abandon_orphaned()?;
                return self.outcome().map(|()| true);
            }
            Affinity::Elsewhere => {}
        }

        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait().map(|()| true);
        };

        let mut completion = self.completion.lock();
        while !completion.done {
            if self
                .completion_condvar
                .wait_until(&mut completion, deadline)
                .timed_out()
            {
                break;
            }
        }
        let done = completion.done;
        drop(completion);

        if !done {
            return Ok(false);
        }
        self.outcome().map(|()| true)
    }

    fn run_inline(&self, binding: &Binding, scheduler: &dyn Scheduler) -> TaskResult<()> {
        let ran = match binding.runnable.upgrade() {
            Some(runnable) => scheduler.run_inline(runnable),
            None => self.run(),
        };
        match ran {
            // Execution errors are reported through `outcome`
            Err(error) if !self.is_completed() => Err(error),
            _ => Ok(()),
        }
    }

    /// Nothing is left to run a task whose scheduler was dropped while its
    /// former worker thread waits on it
    fn abandon_orphaned(&self) -> TaskResult<()> {
        self.abandon_with(TaskError::Disposed);
        if self.is_completed() {
            Ok(())
        } else {
            Err(TaskError::AlreadyRunning)
        }
    }

    fn outcome(&self) -> TaskResult<()> {
        match self.failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Record the final state, wake waiters and fire callbacks
    fn finish(&self, failure: Option<TaskError>) {
        let state = if failure.is_some() {
            TaskState::Failed
        } else {
            TaskState::Complete
        };
        if let Some(error) = failure {
            *self.failure.lock() = Some(error);
        }
        *self.state.lock() = state;

        let callbacks = {
            let mut completion = self.completion.lock();
            completion.done = true;
            self.completion_condvar.notify_all();
            std::mem::take(&mut completion.callbacks)
        };

        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                warn!(
                    task = %self.id,
                    "completion callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn abandon_with(&self, reason: TaskError) {
        {
            let state = self.state.lock();
            if state.is_completed() || *state == TaskState::Running {
                return;
            }
            self.action.lock().take();
        }
        debug!(task = %self.id, "task abandoned: {}", reason);
        self.finish(Some(reason));
    }
}

impl<T: Send + 'static> Task<T> {
    /// Bind to `scheduler` and hand `runnable` (this task, or a decorator
    /// around it) to the requested queue
    pub(crate) fn schedule(
        &self,
        runnable: Arc<dyn Runnable>,
        scheduler: Arc<dyn Scheduler>,
        debug: bool,
    ) -> TaskResult<()> {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Initialized {
                return Err(TaskError::AlreadyScheduled);
            }
            let binding = Binding {
                scheduler: Arc::downgrade(&scheduler),
                runnable: Arc::downgrade(&runnable),
                worker: scheduler.worker_thread(),
            };
            if self.binding.set(binding).is_err() {
                return Err(TaskError::AlreadyScheduled);
            }
            *state = TaskState::Pending;
        }

        let queued = if debug {
            scheduler.queue_debug_task(runnable)
        } else {
            scheduler.queue_task(runnable)
        };

        if let Err(error) = queued {
            self.abandon_with(error.clone());
            return Err(error);
        }
        Ok(())
    }

    /// Get an awaiter for cooperative suspension on this task
    pub fn get_awaiter(self: &Arc<Self>) -> TaskResult<Awaiter<T>> {
        if !self.is_scheduled() {
            return Err(TaskError::Unscheduled);
        }
        Ok(Awaiter::new(self.clone()))
    }
}

impl<T: Clone> Task<T> {
    /// Get the result (if completed)
    pub fn result(&self) -> Option<T> {
        self.result.lock().clone()
    }
}

impl<T: Send + 'static> Runnable for Task<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> Option<String> {
        Task::name(self)
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn state(&self) -> TaskState {
        Task::state(self)
    }

    fn run(&self) -> TaskResult<()> {
        Task::run(self)
    }

    fn abandon(&self, reason: TaskError) {
        self.abandon_with(reason);
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
