//! Ordered batch task queue with a single cursor.
//!
//! The queue is rebuilt from `tasks.json` plus the [`BatchProgress`] stored in
//! the loop state, mutated in memory, and written back through the state store.

use std::collections::HashSet;

use crate::core::types::{BatchProgress, Task};
use crate::error::{LoopError, LoopResult};

/// `advance()` was called on the last task.
///
/// This is the expected end of a batch, not a failure; the controller turns
/// it into a batch completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no more tasks in the queue")]
pub struct NoMoreTasks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueue {
    tasks: Vec<Task>,
    cursor: usize,
    task_iteration: u32,
}

impl TaskQueue {
    /// Build a queue positioned on the first task.
    ///
    /// Fails if the list is empty or contains duplicate ids.
    pub fn new(tasks: Vec<Task>) -> LoopResult<Self> {
        validate_tasks(&tasks).map_err(LoopError::InvalidArgument)?;
        Ok(Self {
            tasks,
            cursor: 0,
            task_iteration: 1,
        })
    }

    /// Rebuild a queue from persisted progress.
    ///
    /// Returns `None` if the tasks and the cursor disagree (the documents are
    /// inconsistent and must be reported as corrupted by the caller).
    pub fn resume(tasks: Vec<Task>, progress: &BatchProgress) -> Option<Self> {
        if validate_tasks(&tasks).is_err()
            || progress.task_index >= tasks.len()
            || progress.tasks_total != tasks.len()
        {
            return None;
        }
        Some(Self {
            tasks,
            cursor: progress.task_index,
            task_iteration: progress.task_iteration.max(1),
        })
    }

    pub fn current(&self) -> &Task {
        &self.tasks[self.cursor]
    }

    /// Zero-based position of the current task.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Iterations spent on the current task.
    pub fn task_iteration(&self) -> u32 {
        self.task_iteration
    }

    /// Count one more iteration against the current task.
    pub fn record_iteration(&mut self) -> u32 {
        self.task_iteration += 1;
        self.task_iteration
    }

    /// Move the cursor to the next task and reset the task-local counter.
    ///
    /// On the last task the cursor stays put and [`NoMoreTasks`] is returned.
    pub fn advance(&mut self) -> Result<&Task, NoMoreTasks> {
        if self.cursor + 1 >= self.tasks.len() {
            return Err(NoMoreTasks);
        }
        self.cursor += 1;
        self.task_iteration = 1;
        Ok(&self.tasks[self.cursor])
    }

    /// Resolve a task by exact id, falling back to a title substring match.
    ///
    /// An exact id always wins over any title match, even one earlier in the
    /// queue. Title matching is case-insensitive and returns the first hit in
    /// queue order.
    pub fn get_task(&self, query: &str) -> Option<&Task> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        if let Some(task) = self.tasks.iter().find(|task| task.id == query) {
            return Some(task);
        }
        let needle = query.to_lowercase();
        self.tasks
            .iter()
            .find(|task| task.title.to_lowercase().contains(&needle))
    }

    /// Snapshot of the cursor for persistence.
    pub fn progress(&self, task_max_iterations: u32) -> BatchProgress {
        BatchProgress {
            task_index: self.cursor,
            task_iteration: self.task_iteration,
            task_max_iterations,
            tasks_total: self.tasks.len(),
        }
    }
}

/// Check queue-level invariants: non-empty, non-blank unique ids.
pub fn validate_tasks(tasks: &[Task]) -> Result<(), String> {
    if tasks.is_empty() {
        return Err("task list is empty; provide at least one task".to_string());
    }
    let mut seen = HashSet::new();
    for task in tasks {
        if task.id.trim().is_empty() {
            return Err("task id must not be blank".to_string());
        }
        if !seen.insert(task.id.as_str()) {
            return Err(format!("duplicate task id '{}'", task.id));
        }
    }
    Ok(())
}
