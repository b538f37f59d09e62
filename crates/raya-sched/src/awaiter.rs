//! Awaiter: a Task as a `Future`
//!
//! The awaiter registers a completion callback that wakes the polling
//! future. It never blocks a thread, so awaiting on the worker thread is
//! safe. The continuation is woken on whichever thread finishes the task
//! (normally the worker); executors that need a particular thread must
//! re-dispatch themselves.

use crate::task::Task;
use crate::{TaskError, TaskResult};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Awaits completion of a scheduled [`Task`]
pub struct Awaiter<T> {
    task: Arc<Task<T>>,

    /// Most recent waker, replaced on every poll
    waker: Arc<Mutex<Option<Waker>>>,

    /// Whether the wake-up callback was registered with the task
    registered: bool,
}

impl<T: Send + 'static> Awaiter<T> {
    pub(crate) fn new(task: Arc<Task<T>>) -> Self {
        Self {
            task,
            waker: Arc::new(Mutex::new(None)),
            registered: false,
        }
    }

    /// Whether the awaited task has finished
    pub fn is_completed(&self) -> bool {
        self.task.is_completed()
    }

    /// Register a continuation with the task's completion callbacks
    pub fn on_completed<F>(&self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.task.on_completed(continuation);
    }

    /// The awaited task
    pub fn task(&self) -> &Arc<Task<T>> {
        &self.task
    }

    fn take_outcome(&self) -> TaskResult<T> {
        if let Some(error) = self.task.failure() {
            return Err(error);
        }
        self.task.take_result().ok_or(TaskError::ResultTaken)
    }
}

impl<T: Clone + Send + 'static> Awaiter<T> {
    /// Result of the task, or its failure
    ///
    /// `Ok(None)` while the task has not finished.
    pub fn get_result(&self) -> TaskResult<Option<T>> {
        match self.task.failure() {
            Some(error) => Err(error),
            None => Ok(self.task.result()),
        }
    }
}

impl<T: Send + 'static> Future for Awaiter<T> {
    type Output = TaskResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.task.is_completed() {
            return Poll::Ready(this.take_outcome());
        }

        *this.waker.lock() = Some(cx.waker().clone());

        if !this.registered {
            this.registered = true;
            let slot = this.waker.clone();
            this.task.on_completed(move || {
                if let Some(waker) = slot.lock().take() {
                    waker.wake();
                }
            });
        }

        // The task may have finished between the first check and registration
        if this.task.is_completed() {
            return Poll::Ready(this.take_outcome());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::task::Runnable;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct HoldingScheduler {
        queued: Mutex<Vec<Arc<dyn Runnable>>>,
    }

    impl Scheduler for HoldingScheduler {
        fn queue_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
            self.queued.lock().push(task);
            Ok(())
        }

        fn queue_debug_task(&self, task: Arc<dyn Runnable>) -> TaskResult<()> {
            self.queue_task(task)
        }

        fn enter_break_state(&self) -> TaskResult<()> {
            Ok(())
        }

        fn exit_break_state(&self) {}

        fn can_execute_in_this_thread(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_awaiter_get_result() {
        let scheduler = Arc::new(HoldingScheduler::default());
        let task = Arc::new(Task::new(|| 5)).start(scheduler.clone()).unwrap();
        let awaiter = task.get_awaiter().unwrap();

        assert!(!awaiter.is_completed());
        assert_eq!(awaiter.get_result().unwrap(), None);

        scheduler.queued.lock().pop().unwrap().run().unwrap();

        assert!(awaiter.is_completed());
        assert_eq!(awaiter.get_result().unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_await_completed_elsewhere() {
        let scheduler = Arc::new(HoldingScheduler::default());
        let task = Arc::new(Task::new(|| "done".to_string()))
            .start(scheduler.clone())
            .unwrap();

        let queued = scheduler.queued.lock().pop().unwrap();
        let runner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            queued.run()
        });

        let value = task.get_awaiter().unwrap().await.unwrap();
        assert_eq!(value, "done");
        runner.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_await_failure() {
        let scheduler = Arc::new(HoldingScheduler::default());
        let task = Arc::new(Task::<u8>::fallible(|| anyhow::bail!("script error")))
            .start(scheduler.clone())
            .unwrap();

        let queued = scheduler.queued.lock().pop().unwrap();
        assert!(queued.run().is_err());

        let err = task.get_awaiter().unwrap().await.unwrap_err();
        assert!(matches!(err, TaskError::Failed(_)));
    }

    #[tokio::test]
    async fn test_await_twice_reports_taken_result() {
        let scheduler = Arc::new(HoldingScheduler::default());
        let task = Arc::new(Task::new(|| 1u32)).start(scheduler.clone()).unwrap();
        scheduler.queued.lock().pop().unwrap().run().unwrap();

        assert_eq!(task.get_awaiter().unwrap().await.unwrap(), 1);
        assert!(matches!(
            task.get_awaiter().unwrap().await,
            Err(TaskError::ResultTaken)
        ));
    }
}
