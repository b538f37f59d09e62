//! Priority-FIFO scheduler
//!
//! A single dedicated worker thread drains the main queue, highest priority
//! first and FIFO within a priority. A task running on the worker may put
//! the scheduler into break state, in which the worker services a separate
//! debug queue from inside that task's stack frame until break state is
//! exited. Nothing ever runs concurrently: break state is nested,
//! single-threaded re-entrancy.

use crate::queue::TaskQueue;
use crate::scheduler::Scheduler;
use crate::task::{Runnable, TaskState};
use crate::{TaskError, TaskResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, trace, warn};

/// Worker thread configuration
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Name of the worker thread
    pub thread_name: String,

    /// Worker stack size in bytes (None = platform default)
    pub stack_size: Option<usize>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            thread_name: "raya-pfifo".to_string(),
            stack_size: None,
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Tasks accepted by either queue
    pub tasks_queued: u64,

    /// Tasks the worker ran to completion
    pub tasks_completed: u64,

    /// Tasks the worker ran that failed
    pub tasks_failed: u64,

    /// Tasks waiting in the main queue
    pub pending_tasks: usize,

    /// Tasks waiting in the debug queue
    pub pending_debug_tasks: usize,

    /// Whether the worker is in break state
    pub in_break: bool,
}

/// Debug queue plus the break flag that gates it
struct DebugLane {
    tasks: TaskQueue,
    in_break: bool,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// State shared between the scheduler handle and its worker thread
struct Shared {
    /// Cleared once on disposal
    alive: AtomicBool,

    /// Main queue
    tasks: Mutex<TaskQueue>,

    /// Signalled when a task is queued or on disposal
    task_ready: Condvar,

    /// Debug queue and break flag
    debug: Mutex<DebugLane>,

    /// Signalled when a debug task is queued, break state ends, or on disposal
    debug_ready: Condvar,

    /// Tasks executing on the worker, innermost last
    ///
    /// More than one entry means nesting through a re-entrant wait or a
    /// debug task run in break state.
    running: Mutex<Vec<Arc<dyn Runnable>>>,

    counters: Counters,
}

impl Shared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Worker thread main loop
    fn run_loop(&self) {
        debug!("scheduler worker started");

        while let Some(task) = self.next_task() {
            self.execute(&task);
        }

        self.abandon_queued();
        debug!("scheduler worker shutting down");
    }

    /// Block until a main-queue task is available; None once disposed
    fn next_task(&self) -> Option<Arc<dyn Runnable>> {
        let mut tasks = self.tasks.lock();
        loop {
            if !self.is_alive() {
                return None;
            }
            if let Some(task) = tasks.pop() {
                return Some(task);
            }
            self.task_ready.wait(&mut tasks);
        }
    }

    /// Block until a debug task is available; None once break state ends
    fn next_debug_task(&self) -> Option<Arc<dyn Runnable>> {
        let mut lane = self.debug.lock();
        loop {
            if !self.is_alive() {
                return None;
            }
            // Tasks queued before an exit request still run
            if let Some(task) = lane.tasks.pop() {
                return Some(task);
            }
            if !lane.in_break {
                return None;
            }
            self.debug_ready.wait(&mut lane);
        }
    }

    /// Run one task inside its own failure boundary
    fn execute(&self, task: &Arc<dyn Runnable>) {
        // Already ran inline through a re-entrant wait
        if task.state() != TaskState::Pending {
            trace!(task = %task.id(), state = ?task.state(), "skipping task");
            return;
        }

        match self.run_tracked(task) {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                trace!(task = %task.id(), "task complete");
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    task = %task.id(),
                    name = ?task.name(),
                    priority = ?task.priority(),
                    "task failed: {}",
                    error
                );
            }
        }
    }

    /// Run a task with it on top of the running stack
    fn run_tracked(&self, task: &Arc<dyn Runnable>) -> TaskResult<()> {
        self.running.lock().push(task.clone());
        let outcome = task.run();
        self.running.lock().pop();
        outcome
    }

    /// Fail every task still queued so that no waiter hangs
    fn abandon_queued(&self) {
        let mut abandoned = self.tasks.lock().drain();
        abandoned.extend(self.debug.lock().tasks.drain());

        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning queued tasks");
        }
        for task in abandoned {
            task.abandon(TaskError::Disposed);
        }
    }
}

/// Prioritized first-in-first-out scheduler with a single worker thread
pub struct PfifoScheduler {
    /// State shared with the worker
    shared: Arc<Shared>,

    /// Identity of the worker thread
    worker: ThreadId,

    /// Worker thread handle, taken by `shutdown`
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PfifoScheduler {
    /// Create a scheduler with default options and start its worker
    pub fn new() -> TaskResult<Arc<Self>> {
        Self::with_options(SchedulerOptions::default())
    }

    /// Create a scheduler and start its worker
    pub fn with_options(options: SchedulerOptions) -> TaskResult<Arc<Self>> {
        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            tasks: Mutex::new(TaskQueue::new()),
            task_ready: Condvar::new(),
            debug: Mutex::new(DebugLane {
                tasks: TaskQueue::new(),
                in_break: false,
            }),
            debug_ready: Condvar::new(),
            running: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });

        let mut builder = thread::Builder::new().name(options.thread_name.clone());
        if let Some(stack_size) = options.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let worker_state = shared.clone();
        let handle = builder
            .spawn(move || worker_state.run_loop())
            .map_err(|e| TaskError::Spawn(Arc::new(e)))?;
        let worker = handle.thread().id();

        debug!(thread = %options.thread_name, "scheduler created");

        Ok(Arc::new(Self {
            shared,
            worker,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Whether the scheduler still accepts tasks
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Whether the worker is servicing the debug queue
    pub fn is_in_break_state(&self) -> bool {
        self.shared.debug.lock().in_break
    }

    /// Whether the worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let pending_tasks = self.shared.tasks.lock().len();
        let (pending_debug_tasks, in_break) = {
            let lane = self.shared.debug.lock();
            (lane.tasks.len(), lane.in_break)
        };

        SchedulerStats {
            tasks_queued: self.shared.counters.queued.load(Ordering::Relaxed),
            tasks_completed: self.shared.counters.completed.load(Ordering::Relaxed),
            tasks_failed: self.shared.counters.failed.load(Ordering::Relaxed),
            pending_tasks,
            pending_debug_tasks,
            in_break,
        }
    }

    /// Stop accepting tasks and wake the worker so it can retire
    ///
    /// A task that is mid-run finishes first; queued tasks are failed with
    /// [`TaskError::Disposed`]. Does not block.
    pub fn dispose(&self) {
        if !self.shared.alive.swap(false, Ordering::AcqRel) {
            return;
        }

        {
            let mut lane = self.shared.debug.lock();
            lane.in_break = false;
        }
        self.shared.debug_ready.notify_all();

        // Taking the lock orders the store above before a sleeping worker's
        // next check
        drop(self.shared.tasks.lock());
        self.shared.task_ready.notify_all();

        debug!("scheduler disposed");
    }

    /// Dispose and wait for the worker thread to exit
    ///
    /// From the worker thread itself this only disposes.
    pub fn shutdown(&self) {
        self.dispose();

        if self.can_execute_in_this_thread() {
            return;
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("scheduler worker panicked");
            }
        }
    }
}

impl Scheduler for PfifoScheduler {
    fn queue_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
        {
            let mut tasks = self.shared.tasks.lock();
            if !self.shared.is_alive() {
                return Err(TaskError::Disposed);
            }
            trace!(task = %task.id(), priority = ?task.priority(), "task queued");
            tasks.push(task);
        }
        self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.shared.task_ready.notify_one();
        Ok(())
    }

    fn queue_debug_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
        {
            let mut lane = self.shared.debug.lock();
            if !self.shared.is_alive() {
                return Err(TaskError::Disposed);
            }
            if !lane.in_break {
                return Err(TaskError::NotInBreakState);
            }
            trace!(task = %task.id(), priority = ?task.priority(), "debug task queued");
            lane.tasks.push(task);
        }
        self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.shared.debug_ready.notify_one();
        Ok(())
    }

    fn enter_break_state(&self) -> TaskResult<()> {
        if !self.can_execute_in_this_thread() {
            return Err(TaskError::WrongThread);
        }

        {
            let mut lane = self.shared.debug.lock();
            if !self.shared.is_alive() {
                return Err(TaskError::Disposed);
            }
            lane.in_break = true;
        }

        // Every task on the stack is suspended until the break ends
        let interrupted = self.shared.running.lock().clone();
        for task in interrupted.iter().rev() {
            task.on_break();
        }
        let trigger = interrupted.last().map(|t| t.id());
        debug!(task = ?trigger, depth = interrupted.len(), "entered break state");

        while let Some(task) = self.shared.next_debug_task() {
            self.shared.execute(&task);
        }

        for task in &interrupted {
            task.on_resume();
        }
        debug!(task = ?trigger, "left break state");
        Ok(())
    }

    fn exit_break_state(&self) {
        {
            let mut lane = self.shared.debug.lock();
            lane.in_break = false;
        }
        self.shared.debug_ready.notify_all();
    }

    fn can_execute_in_this_thread(&self) -> bool {
        thread::current().id() == self.worker
    }

    fn current_task(&self) -> Option<Arc<dyn Runnable>> {
        if self.can_execute_in_this_thread() {
            self.shared.running.lock().last().cloned()
        } else {
            None
        }
    }

    fn worker_thread(&self) -> Option<ThreadId> {
        Some(self.worker)
    }

    fn run_inline(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
        if !self.can_execute_in_this_thread() {
            return Err(TaskError::WrongThread);
        }
        trace!(task = %task.id(), "running task inline");
        self.shared.run_tracked(&task)
    }

    fn dispose(&self) {
        PfifoScheduler::dispose(self);
    }
}

impl Drop for PfifoScheduler {
    fn drop(&mut self) {
        // The worker is detached rather than joined, so dropping the last
        // handle never blocks on a running task
        self.dispose();
    }
}
