//! Priority-FIFO task queue
//!
//! One FIFO lane per priority level. Popping takes the head of the first
//! non-empty lane, so priority fully dominates arrival order and arrival
//! order only breaks ties within a level.

use crate::task::{Runnable, TaskPriority};
use std::collections::VecDeque;
use std::sync::Arc;

/// Queue of pending tasks ordered by priority, then insertion
pub struct TaskQueue {
    lanes: [VecDeque<Arc<dyn Runnable>>; TaskPriority::COUNT],
    len: usize,
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            lanes: std::array::from_fn(|_| VecDeque::new()),
            len: 0,
        }
    }

    /// Append a task behind every queued task of the same priority
    pub fn push(&mut self, task: Arc<dyn Runnable>) {
        self.lanes[task.priority().index()].push_back(task);
        self.len += 1;
    }

    /// Remove the earliest-queued task of the highest priority present
    pub fn pop(&mut self) -> Option<Arc<dyn Runnable>> {
        if self.len == 0 {
            return None;
        }
        let task = self.lanes.iter_mut().find_map(|lane| lane.pop_front())?;
        self.len -= 1;
        Some(task)
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of queued tasks at `priority`
    pub fn len_at(&self, priority: TaskPriority) -> usize {
        self.lanes[priority.index()].len()
    }

    /// Remove every task, in dequeue order
    pub fn drain(&mut self) -> Vec<Arc<dyn Runnable>> {
        let mut drained = Vec::with_capacity(self.len);
        for lane in self.lanes.iter_mut() {
            drained.extend(lane.drain(..));
        }
        self.len = 0;
        drained
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskId};

    fn create_test_task(priority: TaskPriority) -> Arc<dyn Runnable> {
        Arc::new(Task::new(|| ()).with_priority(priority))
    }

    fn ids(tasks: &[Arc<dyn Runnable>]) -> Vec<TaskId> {
        tasks.iter().map(|t| t.id()).collect()
    }

    #[test]
    fn test_queue_empty() {
        let mut queue = TaskQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_single_entry() {
        let mut queue = TaskQueue::new();
        let task = create_test_task(TaskPriority::Promise);
        let id = task.id();

        queue.push(task);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().id(), id);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = TaskQueue::new();
        let tasks: Vec<_> = (0..3).map(|_| create_test_task(TaskPriority::Lowest)).collect();
        let expected = ids(&tasks);

        for task in tasks {
            queue.push(task);
        }

        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(ids(&popped), expected);
    }

    #[test]
    fn test_priority_dominates_arrival() {
        let mut queue = TaskQueue::new();
        let lowest = create_test_task(TaskPriority::Lowest);
        let promise = create_test_task(TaskPriority::Promise);
        let init_a = create_test_task(TaskPriority::Initialization);
        let init_b = create_test_task(TaskPriority::Initialization);
        let expected = vec![init_a.id(), init_b.id(), promise.id(), lowest.id()];

        queue.push(lowest);
        queue.push(promise);
        queue.push(init_a);
        queue.push(init_b);
        assert_eq!(queue.len_at(TaskPriority::Initialization), 2);

        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(ids(&popped), expected);
    }

    #[test]
    fn test_drain_in_dequeue_order() {
        let mut queue = TaskQueue::new();
        let callback = create_test_task(TaskPriority::Callback);
        let execution = create_test_task(TaskPriority::Execution);
        let expected = vec![execution.id(), callback.id()];

        queue.push(callback);
        queue.push(execution);

        let drained = queue.drain();
        assert_eq!(ids(&drained), expected);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
