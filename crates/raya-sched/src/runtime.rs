//! Scheduled runtime
//!
//! Keeps a thread-affine resource (typically an engine context) on a
//! scheduler's worker thread. The resource is built by an
//! `Initialization`-priority task, only ever touched from scheduled tasks,
//! and dropped by a final teardown task before the scheduler is disposed.

use crate::pfifo::PfifoScheduler;
use crate::scheduler::{Scheduler, SchedulerExt};
use crate::task::{Task, TaskPriority};
use crate::timed::TimedTask;
use crate::TaskResult;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A resource owned by a scheduler's worker thread
pub struct ScheduledRuntime<R, S = PfifoScheduler>
where
    R: Send + 'static,
    S: Scheduler + 'static,
{
    /// Scheduler whose worker owns the resource
    scheduler: Arc<S>,

    /// The resource; `None` before initialization, after a failed
    /// initialization and after teardown
    resource: Arc<Mutex<Option<R>>>,

    /// Initialization task
    init: Arc<Task<()>>,

    /// Set once teardown has been requested
    shut_down: AtomicBool,
}

impl<R: Send + 'static> ScheduledRuntime<R> {
    /// Start a dedicated priority-FIFO scheduler and build the resource on it
    pub fn new<F>(init: F) -> TaskResult<Self>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        Self::with_scheduler(PfifoScheduler::new()?, init)
    }
}

impl<R, S> ScheduledRuntime<R, S>
where
    R: Send + 'static,
    S: Scheduler + 'static,
{
    /// Build the resource on an existing scheduler
    pub fn with_scheduler<F>(scheduler: Arc<S>, init: F) -> TaskResult<Self>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        let resource = Arc::new(Mutex::new(None));
        let slot = resource.clone();

        let init = scheduler
            .try_run(
                move || {
                    let value = init()?;
                    *slot.lock() = Some(value);
                    Ok(())
                },
                TaskPriority::Initialization,
            )?
            .with_name("initialization");

        Ok(Self {
            scheduler,
            resource,
            init,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Block until initialization has finished, reporting its failure
    pub fn ensure_ready(&self) -> TaskResult<()> {
        self.init.wait()
    }

    /// Whether initialization finished successfully
    pub fn is_ready(&self) -> bool {
        self.init.is_completed() && self.init.failure().is_none()
    }

    /// Schedule work against the resource
    pub fn run<T, F>(&self, f: F, priority: TaskPriority) -> TaskResult<Arc<Task<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> T + Send + 'static,
    {
        self.try_run(move |resource| Ok(f(resource)), priority)
    }

    /// Schedule fallible work against the resource
    pub fn try_run<T, F>(&self, f: F, priority: TaskPriority) -> TaskResult<Arc<Task<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> anyhow::Result<T> + Send + 'static,
    {
        let slot = self.resource.clone();
        self.scheduler
            .try_run(move || with_resource(&slot, f), priority)
    }

    /// Schedule work against the resource with a timeout notification
    pub fn run_timed<T, F, C>(
        &self,
        f: F,
        on_timeout: C,
        timeout: Duration,
        priority: TaskPriority,
    ) -> TaskResult<Arc<TimedTask<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> T + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let slot = self.resource.clone();
        self.scheduler.try_run_timed(
            move || with_resource(&slot, |resource| Ok(f(resource))),
            on_timeout,
            timeout,
            priority,
        )
    }

    /// The scheduler that owns the resource
    pub fn scheduler(&self) -> &Arc<S> {
        &self.scheduler
    }

    /// Drop the resource on the worker thread, then dispose the scheduler
    ///
    /// Work queued earlier runs first. Later calls do nothing.
    pub fn shutdown(&self) -> TaskResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let slot = self.resource.clone();
        let teardown = self.scheduler.try_run(
            move || {
                let mut resource = slot
                    .try_lock()
                    .ok_or_else(|| anyhow!("runtime resource is still borrowed"))?;
                resource.take();
                Ok(())
            },
            TaskPriority::Lowest,
        );

        let outcome = teardown.and_then(|task| task.with_name("teardown").wait());
        self.scheduler.dispose();
        debug!("scheduled runtime shut down");
        outcome
    }
}

impl<R, S> Drop for ScheduledRuntime<R, S>
where
    R: Send + 'static,
    S: Scheduler + 'static,
{
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!("runtime teardown failed: {}", error);
        }
    }
}

/// Lend the resource to `f`
///
/// Every caller runs on the worker thread, so a held lock means an enclosing
/// task is still using the resource.
fn with_resource<R, T, F>(slot: &Mutex<Option<R>>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&mut R) -> anyhow::Result<T>,
{
    let mut guard = slot
        .try_lock()
        .ok_or_else(|| anyhow!("runtime resource is already borrowed by an enclosing task"))?;
    let resource = guard
        .as_mut()
        .ok_or_else(|| anyhow!("runtime resource is not available"))?;
    f(resource)
}
