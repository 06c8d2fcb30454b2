//! State transitions shared by `iterate`, `complete`, `next-task` and the exit hook.
//!
//! Every function here mutates an in-memory [`LoopState`] (and the batch
//! [`TaskQueue`] when present) and reports what happened. Persisting the
//! result and appending history is the caller's job, under the state lock.

use chrono::{DateTime, Utc};

use crate::core::task_queue::TaskQueue;
use crate::core::types::{HistoryEntry, HistoryEvent, LoopState};

/// Outcome of asking for one more agent cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Cycle granted on the same task.
    Continued { iteration: u32 },
    /// The current task's budget was spent; cycle granted on the next task.
    TaskAdvanced { iteration: u32, task_id: String },
    /// This increment reached `max_iterations`: the cycle is granted and the
    /// loop is now inactive, so the following exit attempt is allowed.
    FinalIteration { iteration: u32, max_iterations: u32 },
    /// The limit was already reached; no cycle granted, loop now inactive.
    LimitReached { iteration: u32, max_iterations: u32 },
    /// The last task's budget was spent; no cycle granted, loop now inactive.
    BatchComplete { iteration: u32 },
}

impl CycleOutcome {
    /// True if the agent gets another cycle.
    pub fn granted(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Continued { .. }
                | CycleOutcome::TaskAdvanced { .. }
                | CycleOutcome::FinalIteration { .. }
        )
    }

    pub fn iteration(&self) -> u32 {
        match self {
            CycleOutcome::Continued { iteration }
            | CycleOutcome::TaskAdvanced { iteration, .. }
            | CycleOutcome::FinalIteration { iteration, .. }
            | CycleOutcome::LimitReached { iteration, .. }
            | CycleOutcome::BatchComplete { iteration } => *iteration,
        }
    }
}

/// Grant one more cycle if the limits allow it.
///
/// The global counter moves by exactly one per granted cycle. In batch mode a
/// spent task budget moves the cursor instead of the task-local counter.
pub fn advance_cycle(
    state: &mut LoopState,
    mut queue: Option<&mut TaskQueue>,
    now: DateTime<Utc>,
) -> CycleOutcome {
    if state.limit_reached() {
        state.active = false;
        return CycleOutcome::LimitReached {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
        };
    }

    let mut advanced_to = None;
    if state.task_budget_exhausted()
        && let Some(queue) = queue.as_deref_mut()
    {
        match queue.advance() {
            Ok(task) => advanced_to = Some(task.id.clone()),
            Err(_) => {
                state.active = false;
                return CycleOutcome::BatchComplete {
                    iteration: state.iteration,
                };
            }
        }
    }

    state.iteration += 1;
    state.last_iterate_at = Some(now);
    if let Some(queue) = queue {
        if advanced_to.is_none() {
            queue.record_iteration();
        }
        sync_batch(state, queue);
    }

    if state.limit_reached() {
        state.active = false;
        return CycleOutcome::FinalIteration {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
        };
    }
    match advanced_to {
        Some(task_id) => CycleOutcome::TaskAdvanced {
            iteration: state.iteration,
            task_id,
        },
        None => CycleOutcome::Continued {
            iteration: state.iteration,
        },
    }
}

/// Grant the first cycle of the task the queue just moved to.
///
/// Used after a promise completed the previous task at an exit attempt: the
/// global counter moves by one and the new task starts at its first iteration.
pub fn start_task_cycle(
    state: &mut LoopState,
    queue: &TaskQueue,
    now: DateTime<Utc>,
) -> CycleOutcome {
    if state.limit_reached() {
        state.active = false;
        return CycleOutcome::LimitReached {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
        };
    }
    state.iteration += 1;
    state.last_iterate_at = Some(now);
    sync_batch(state, queue);
    if state.limit_reached() {
        state.active = false;
        return CycleOutcome::FinalIteration {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
        };
    }
    CycleOutcome::TaskAdvanced {
        iteration: state.iteration,
        task_id: queue.current().id.clone(),
    }
}

/// Outcome of finishing the current unit of work (promise or manual skip).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransition {
    /// Single mode: the loop is finished.
    LoopFinished,
    /// Batch mode: moved on to the next task.
    NextTask { task_id: String, position: usize },
    /// Batch mode: that was the last task; the loop is finished.
    BatchFinished,
}

/// Finish the current task (or the whole single-mode loop).
///
/// `NoMoreTasks` from the queue is the normal end of a batch and is folded
/// into [`TaskTransition::BatchFinished`].
pub fn finish_task(state: &mut LoopState, queue: Option<&mut TaskQueue>) -> TaskTransition {
    let Some(queue) = queue else {
        state.active = false;
        return TaskTransition::LoopFinished;
    };
    match queue.advance() {
        Ok(task) => {
            let task_id = task.id.clone();
            sync_batch(state, queue);
            TaskTransition::NextTask {
                task_id,
                position: queue.position(),
            }
        }
        Err(_) => {
            state.active = false;
            TaskTransition::BatchFinished
        }
    }
}

/// Copy the queue cursor back into the state.
pub fn sync_batch(state: &mut LoopState, queue: &TaskQueue) {
    let task_max = state
        .batch
        .as_ref()
        .map_or(0, |progress| progress.task_max_iterations);
    state.batch = Some(queue.progress(task_max));
    state.current_task_id = Some(queue.current().id.clone());
}

/// History records describing a cycle outcome.
pub fn cycle_history(
    outcome: &CycleOutcome,
    previous_task: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<HistoryEntry> {
    let iteration = outcome.iteration();
    let task_note = |entry: HistoryEntry| match previous_task {
        Some(id) => entry.with_notes(format!("task {id}")),
        None => entry,
    };
    match outcome {
        CycleOutcome::Continued { .. } => {
            vec![HistoryEntry::new(HistoryEvent::Iterate, iteration, now)]
        }
        CycleOutcome::TaskAdvanced { task_id, .. } => vec![
            task_note(HistoryEntry::new(HistoryEvent::TaskMaxReached, iteration, now)),
            HistoryEntry::new(HistoryEvent::Iterate, iteration, now)
                .with_notes(format!("now on task {task_id}")),
        ],
        CycleOutcome::FinalIteration { max_iterations, .. } => vec![
            HistoryEntry::new(HistoryEvent::Iterate, iteration, now),
            HistoryEntry::new(HistoryEvent::MaxReached, iteration, now)
                .with_notes(format!("max iterations ({max_iterations}) reached")),
        ],
        CycleOutcome::LimitReached { max_iterations, .. } => vec![
            HistoryEntry::new(HistoryEvent::MaxReached, iteration, now)
                .with_notes(format!("max iterations ({max_iterations}) reached")),
        ],
        CycleOutcome::BatchComplete { .. } => vec![
            task_note(HistoryEntry::new(HistoryEvent::TaskMaxReached, iteration, now)),
            HistoryEntry::new(HistoryEvent::BatchCompleted, iteration, now),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BatchProgress, Task};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: format!("{id} title"),
            prompt: format!("{id} prompt"),
            file: None,
        }
    }

    fn batch_state(queue: &TaskQueue, task_max: u32, max_total: u32) -> LoopState {
        LoopState::batch(
            max_total,
            None,
            queue.current().id.clone(),
            queue.progress(task_max),
            now(),
        )
    }

    #[test]
    fn iteration_increases_by_exactly_one_per_cycle() {
        let mut state = LoopState::single(0, None, now());
        for expected in 2..=20 {
            let outcome = advance_cycle(&mut state, None, now());
            assert_eq!(outcome, CycleOutcome::Continued { iteration: expected });
            assert_eq!(state.iteration, expected);
            assert!(state.active);
        }
    }

    #[test]
    fn loop_deactivates_exactly_when_limit_is_reached() {
        let mut state = LoopState::single(4, None, now());
        assert!(advance_cycle(&mut state, None, now()).granted());
        assert!(state.active);
        assert!(advance_cycle(&mut state, None, now()).granted());
        assert!(state.active);

        let outcome = advance_cycle(&mut state, None, now());
        assert_eq!(
            outcome,
            CycleOutcome::FinalIteration {
                iteration: 4,
                max_iterations: 4
            }
        );
        assert!(!state.active);
    }

    #[test]
    fn limit_at_creation_grants_nothing() {
        let mut state = LoopState::single(1, None, now());
        let outcome = advance_cycle(&mut state, None, now());
        assert_eq!(
            outcome,
            CycleOutcome::LimitReached {
                iteration: 1,
                max_iterations: 1
            }
        );
        assert_eq!(state.iteration, 1);
        assert!(!state.active);
    }

    #[test]
    fn spent_task_budget_moves_to_next_task() {
        let mut queue = TaskQueue::new(vec![task("T1"), task("T2")]).expect("queue");
        let mut state = batch_state(&queue, 2, 0);

        let outcome = advance_cycle(&mut state, Some(&mut queue), now());
        assert_eq!(outcome, CycleOutcome::Continued { iteration: 2 });
        assert_eq!(queue.task_iteration(), 2);

        let outcome = advance_cycle(&mut state, Some(&mut queue), now());
        assert_eq!(
            outcome,
            CycleOutcome::TaskAdvanced {
                iteration: 3,
                task_id: "T2".to_string()
            }
        );
        assert_eq!(state.current_task_id.as_deref(), Some("T2"));
        assert_eq!(
            state.batch,
            Some(BatchProgress {
                task_index: 1,
                task_iteration: 1,
                task_max_iterations: 2,
                tasks_total: 2,
            })
        );
    }

    #[test]
    fn spent_budget_on_last_task_completes_batch() {
        let mut queue = TaskQueue::new(vec![task("only")]).expect("queue");
        let mut state = batch_state(&queue, 1, 0);

        let outcome = advance_cycle(&mut state, Some(&mut queue), now());
        assert_eq!(outcome, CycleOutcome::BatchComplete { iteration: 1 });
        assert!(!state.active);
        assert_eq!(state.iteration, 1);
    }

    #[test]
    fn finish_task_folds_no_more_tasks_into_batch_finished() {
        let mut queue = TaskQueue::new(vec![task("T1"), task("T2")]).expect("queue");
        let mut state = batch_state(&queue, 5, 0);
        state.iteration = 7;

        let transition = finish_task(&mut state, Some(&mut queue));
        assert_eq!(
            transition,
            TaskTransition::NextTask {
                task_id: "T2".to_string(),
                position: 1
            }
        );
        assert!(state.active);
        assert_eq!(state.iteration, 7);

        let transition = finish_task(&mut state, Some(&mut queue));
        assert_eq!(transition, TaskTransition::BatchFinished);
        assert!(!state.active);
    }

    #[test]
    fn new_task_cycle_counts_globally_but_starts_task_fresh() {
        let mut queue = TaskQueue::new(vec![task("T1"), task("T2")]).expect("queue");
        let mut state = batch_state(&queue, 5, 3);
        state.iteration = 2;
        finish_task(&mut state, Some(&mut queue));

        let outcome = start_task_cycle(&mut state, &queue, now());
        assert_eq!(
            outcome,
            CycleOutcome::FinalIteration {
                iteration: 3,
                max_iterations: 3
            }
        );
        assert_eq!(state.batch.as_ref().map(|b| b.task_iteration), Some(1));
        assert!(!state.active);
    }

    #[test]
    fn finish_task_in_single_mode_ends_loop() {
        let mut state = LoopState::single(0, Some("DONE".to_string()), now());
        assert_eq!(finish_task(&mut state, None), TaskTransition::LoopFinished);
        assert!(!state.active);
    }

    #[test]
    fn final_iteration_records_max_reached() {
        let outcome = CycleOutcome::FinalIteration {
            iteration: 3,
            max_iterations: 3,
        };
        let entries = cycle_history(&outcome, None, now());
        let events: Vec<_> = entries.iter().map(|e| e.event).collect();
        assert_eq!(events, vec![HistoryEvent::Iterate, HistoryEvent::MaxReached]);
    }
}
