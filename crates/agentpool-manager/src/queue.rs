//! Priority task queue.

use std::collections::{HashSet, VecDeque};

use agentpool_core::{CoreError, QueueDepths, Task, TaskId, TaskPriority};

/// Tasks awaiting a worker, priority first and FIFO within a tier.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tiers: [VecDeque<Task>; 4],
    ids: HashSet<TaskId>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail of the task's tier.
    pub fn enqueue(&mut self, task: Task) -> Result<(), CoreError> {
        if !self.ids.insert(task.id.clone()) {
            return Err(CoreError::DuplicateTask(task.id.to_string()));
        }
        self.tiers[task.priority.rank()].push_back(task);
        Ok(())
    }

    /// Put a task back at the head of its tier, as if it was never taken.
    pub fn push_front(&mut self, task: Task) -> Result<(), CoreError> {
        if !self.ids.insert(task.id.clone()) {
            return Err(CoreError::DuplicateTask(task.id.to_string()));
        }
        self.tiers[task.priority.rank()].push_front(task);
        Ok(())
    }

    /// Pop the highest-priority, oldest task accepted by `eligible`.
    ///
    /// Ineligible tasks keep their position. Nothing is popped when there is
    /// no idle worker to take it.
    pub fn dequeue_next<F>(&mut self, idle_workers: usize, eligible: F) -> Option<Task>
    where
        F: Fn(&Task) -> bool,
    {
        if idle_workers == 0 {
            return None;
        }
        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(&eligible) {
                let task = tier.remove(pos)?;
                self.ids.remove(&task.id);
                return Some(task);
            }
        }
        None
    }

    /// Remove a task by id. Removing an absent id is not an error.
    pub fn remove(&mut self, task_id: &TaskId) -> Option<Task> {
        if !self.ids.remove(task_id) {
            return None;
        }
        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|t| &t.id == task_id) {
                return tier.remove(pos);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Queue depth for one tier.
    pub fn depth(&self, priority: TaskPriority) -> usize {
        self.tiers[priority.rank()].len()
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            high: self.depth(TaskPriority::High),
            medium: self.depth(TaskPriority::Medium),
            low: self.depth(TaskPriority::Low),
            background: self.depth(TaskPriority::Background),
        }
    }

    /// Queued tasks in service order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tiers.iter().flat_map(|tier| tier.iter())
    }

    /// Remove everything, in service order.
    pub fn drain(&mut self) -> Vec<Task> {
        self.ids.clear();
        self.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: TaskPriority) -> Task {
        Task::shell("true").with_id(id).with_priority(priority)
    }

    fn drain_order(queue: &mut TaskQueue) -> Vec<String> {
        let mut order = Vec::new();
        while let Some(t) = queue.dequeue_next(1, |_| true) {
            order.push(t.id.into_inner());
        }
        order
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = TaskQueue::new();
        queue.enqueue(task("bg", TaskPriority::Background)).unwrap();
        queue.enqueue(task("low-1", TaskPriority::Low)).unwrap();
        queue.enqueue(task("high-1", TaskPriority::High)).unwrap();
        queue.enqueue(task("med", TaskPriority::Medium)).unwrap();
        queue.enqueue(task("high-2", TaskPriority::High)).unwrap();
        queue.enqueue(task("low-2", TaskPriority::Low)).unwrap();

        assert_eq!(queue.len(), 6);
        assert_eq!(queue.depth(TaskPriority::High), 2);
        let depths = queue.depths();
        assert_eq!((depths.high, depths.medium, depths.low, depths.background), (2, 1, 2, 1));
        assert_eq!(
            drain_order(&mut queue),
            vec!["high-1", "high-2", "med", "low-1", "low-2", "bg"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut queue = TaskQueue::new();
        queue.enqueue(task("a", TaskPriority::High)).unwrap();
        let err = queue.enqueue(task("a", TaskPriority::Low)).unwrap_err();
        assert_eq!(err, CoreError::DuplicateTask("a".to_string()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_no_idle_workers_pops_nothing() {
        let mut queue = TaskQueue::new();
        queue.enqueue(task("a", TaskPriority::High)).unwrap();
        assert!(queue.dequeue_next(0, |_| true).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ineligible_tasks_are_skipped_not_removed() {
        let mut queue = TaskQueue::new();
        queue
            .enqueue(task("ws-a", TaskPriority::High).with_workstream("alpha"))
            .unwrap();
        queue.enqueue(task("free", TaskPriority::Low)).unwrap();

        let next = queue
            .dequeue_next(1, |t| t.workstream() != Some("alpha"))
            .unwrap();
        assert_eq!(next.id.as_str(), "free");
        assert!(queue.iter().any(|t| t.id.as_str() == "ws-a"));
        assert!(queue.dequeue_next(1, |t| t.workstream() != Some("alpha")).is_none());
        assert_eq!(drain_order(&mut queue), vec!["ws-a"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut queue = TaskQueue::new();
        queue.enqueue(task("a", TaskPriority::Medium)).unwrap();
        queue.enqueue(task("b", TaskPriority::Medium)).unwrap();

        assert!(queue.remove(&TaskId::new("a")).is_some());
        assert!(queue.remove(&TaskId::new("a")).is_none());
        assert!(queue.remove(&TaskId::new("missing")).is_none());
        assert_eq!(drain_order(&mut queue), vec!["b"]);
    }

    #[test]
    fn test_push_front_and_drain() {
        let mut queue = TaskQueue::new();
        queue.enqueue(task("a", TaskPriority::Medium)).unwrap();
        queue.push_front(task("b", TaskPriority::Medium)).unwrap();
        queue.enqueue(task("c", TaskPriority::High)).unwrap();

        let ids: Vec<&str> = queue.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(queue.drain().len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.depths(), QueueDepths::default());
    }
}
