//! Bounded memory of finished tasks.
//!
//! Terminal task records leave the manager's live map as soon as their
//! waiter is notified. Only the id and final status are kept here, for
//! dependency checks and `AlreadyTerminal` answers, and the oldest entries
//! fall off once `capacity` is reached.

use std::collections::{HashMap, VecDeque};

use agentpool_core::{TaskId, TaskStatus};

#[derive(Debug)]
pub(crate) struct FinishedTasks {
    capacity: usize,
    statuses: HashMap<TaskId, TaskStatus>,
    order: VecDeque<TaskId>,
}

impl FinishedTasks {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            statuses: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Remember a terminal status, forgetting the oldest entry when full.
    pub fn record(&mut self, task_id: TaskId, status: TaskStatus) {
        if self.capacity == 0 {
            return;
        }
        if self.statuses.insert(task_id.clone(), status).is_some() {
            return;
        }
        self.order.push_back(task_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.statuses.get(task_id).copied()
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.statuses.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}
