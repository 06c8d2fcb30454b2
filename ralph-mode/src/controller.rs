//! Loop lifecycle operations behind the CLI commands.
//!
//! Every mutation runs as one read-modify-write under the state lock:
//! load `state.json`, apply a transition from [`crate::core::cycle`], write
//! the new state (the commit point), then append history.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::cycle::{
    CycleOutcome, TaskTransition, advance_cycle, cycle_history, finish_task,
};
use crate::core::promise;
use crate::core::task_queue::{TaskQueue, validate_tasks};
use crate::core::types::{HistoryEntry, HistoryEvent, LoopMode, LoopState, Task};
use crate::error::{LoopError, LoopResult};
use crate::io::config::{EnvOverrides, RalphConfig};
use crate::io::instructions::{render_instructions, render_task_file, task_file_name};
use crate::io::paths::RalphPaths;
use crate::io::state_store::{Loaded, StateStore};
use crate::io::workspace;

/// Result of checking agent output for the completion promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Single-mode loop finished.
    Completed { iteration: u32 },
    /// A batch task finished and the queue moved on.
    TaskCompleted {
        task_id: String,
        next_task_id: String,
    },
    /// The last batch task finished.
    BatchCompleted { task_id: String },
    /// No promise configured, or not found in the output.
    NotComplete,
    /// Promise found, but the workspace is unchanged since the task started.
    NoObservableChange,
    /// The loop had already finished.
    AlreadyFinished,
}

/// What `disable` removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disabled {
    /// The loop state that was removed, if it was readable.
    pub previous: Option<LoopState>,
    /// Whether a state document existed at all.
    pub removed: bool,
}

/// Snapshot printed by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub state: LoopState,
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Task>,
    /// 1-based position of the current task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_number: Option<usize>,
    pub history_entries: usize,
}

#[derive(Debug, Clone)]
pub struct LoopController {
    store: StateStore,
    completion_guard: bool,
}

impl LoopController {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            completion_guard: true,
        }
    }

    /// Controller for the workspace at `root` using loaded config and env.
    pub fn open(root: &Path, config: &RalphConfig, env: &EnvOverrides) -> Self {
        let store = StateStore::new(RalphPaths::new(root), config.lock_timeout());
        Self::new(store).with_completion_guard(config.completion_guard && !env.allow_no_change)
    }

    pub fn with_completion_guard(mut self, enabled: bool) -> Self {
        self.completion_guard = enabled;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Start a single-prompt loop at iteration 1.
    #[instrument(skip_all, fields(max_iterations))]
    pub fn enable(
        &self,
        prompt: &str,
        max_iterations: u32,
        completion_promise: Option<String>,
    ) -> LoopResult<LoopState> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(LoopError::InvalidArgument(
                "prompt must not be empty".to_string(),
            ));
        }
        self.store.with_lock(|store| {
            ensure_replaceable(store)?;
            let now = Utc::now();
            let mut state = LoopState::single(max_iterations, completion_promise, now);
            state.baseline_fingerprint = self.fingerprint();
            let instructions = render_instructions(&state, self.guards_changes(&state))?;

            // New companions first, then the commit point, then cleanup, so a
            // failed write leaves the previous loop in place.
            store.write_instructions(&instructions)?;
            store.save_prompt(prompt)?;
            store.save(&state)?;
            store.reset_history(
                &HistoryEntry::new(HistoryEvent::Started, state.iteration, now)
                    .with_notes(format!("max_iterations={max_iterations}")),
            )?;
            store.remove_stale(LoopMode::Single, &[])?;
            info!(max_iterations, "loop enabled");
            Ok(state)
        })
    }

    /// Start a batch loop over `tasks`.
    ///
    /// `max_iterations` is the per-task budget and `max_total_iterations` the
    /// global limit; 0 means unbounded for either.
    #[instrument(skip_all, fields(tasks = tasks.len(), max_iterations, max_total_iterations))]
    pub fn batch_init(
        &self,
        mut tasks: Vec<Task>,
        max_iterations: u32,
        max_total_iterations: u32,
        completion_promise: Option<String>,
    ) -> LoopResult<LoopState> {
        validate_tasks(&tasks).map_err(LoopError::InvalidArgument)?;
        self.store.with_lock(|store| {
            ensure_replaceable(store)?;
            let names: Vec<String> = tasks
                .iter()
                .enumerate()
                .map(|(index, task)| task_file_name(index, task))
                .collect();
            for (task, name) in tasks.iter_mut().zip(&names) {
                task.file = Some(store.task_file_path(name));
            }
            let queue = TaskQueue::new(tasks)?;

            let now = Utc::now();
            let mut state = LoopState::batch(
                max_total_iterations,
                completion_promise,
                queue.current().id.clone(),
                queue.progress(max_iterations),
                now,
            );
            state.baseline_fingerprint = self.fingerprint();
            let instructions = render_instructions(&state, self.guards_changes(&state))?;

            for (task, name) in queue.tasks().iter().zip(&names) {
                store.write_task_file(name, &render_task_file(task))?;
            }
            store.save_tasks(queue.tasks())?;
            store.write_instructions(&instructions)?;
            store.save(&state)?;
            store.reset_history(
                &HistoryEntry::new(HistoryEvent::BatchStarted, state.iteration, now)
                    .with_notes(format!("tasks: {}", queue.len())),
            )?;
            store.remove_stale(LoopMode::Batch, &names)?;
            info!(tasks = queue.len(), "batch loop enabled");
            Ok(state)
        })
    }

    /// Remove the loop and all its artifacts. Safe to repeat.
    #[instrument(skip_all)]
    pub fn disable(&self) -> LoopResult<Disabled> {
        let disabled = self
            .store
            .with_existing_lock(|store| {
                let previous = store.load()?.present();
                let removed = store.clear()?;
                info!(removed, "loop disabled");
                Ok(Disabled { previous, removed })
            })?;
        Ok(disabled.unwrap_or(Disabled {
            previous: None,
            removed: false,
        }))
    }

    /// Count one more iteration (manual equivalent of a blocked exit).
    #[instrument(skip_all)]
    pub fn iterate(&self) -> LoopResult<CycleOutcome> {
        self.store
            .with_existing_lock(|store| {
                let mut state = store.load_required()?;
                if !state.active {
                    return Err(LoopError::NoActiveLoop);
                }
                let mut queue = self.load_queue(&state)?;
                let previous_task = state.current_task_id.clone();
                let now = Utc::now();

                let outcome = advance_cycle(&mut state, queue.as_mut(), now);
                if matches!(outcome, CycleOutcome::TaskAdvanced { .. }) {
                    self.refresh_baseline(&mut state);
                }
                store.save(&state)?;
                store.append_history_all(&cycle_history(&outcome, previous_task.as_deref(), now))?;
                debug!(?outcome, "iterate");
                Ok(outcome)
            })?
            .ok_or(LoopError::NoActiveLoop)
    }

    /// Check `output` for the completion promise and finish the loop or the
    /// current batch task if it is there.
    #[instrument(skip_all)]
    pub fn complete(&self, output: &str) -> LoopResult<CompleteOutcome> {
        self.store
            .with_existing_lock(|store| {
                let mut state = store.load_required()?;
                let mut queue = if state.active {
                    self.load_queue(&state)?
                } else {
                    None
                };
                let now = Utc::now();
                let (outcome, history) =
                    self.apply_completion(&mut state, queue.as_mut(), output, now);
                if !history.is_empty() {
                    store.save(&state)?;
                    store.append_history_all(&history)?;
                }
                Ok(outcome)
            })?
            .ok_or(LoopError::NoActiveLoop)
    }

    /// Skip the current batch task.
    #[instrument(skip_all)]
    pub fn next_task(&self) -> LoopResult<TaskTransition> {
        self.store
            .with_existing_lock(|store| {
                let mut state = store.load_required()?;
                if !state.is_batch() {
                    return Err(LoopError::WrongMode {
                        operation: "next-task",
                    });
                }
                if !state.active {
                    return Err(LoopError::NoActiveLoop);
                }
                let mut queue = self.load_queue(&state)?;
                let skipped = state.current_task_id.clone().unwrap_or_default();
                let now = Utc::now();

                let transition = finish_task(&mut state, queue.as_mut());
                let mut history = vec![
                    HistoryEntry::new(HistoryEvent::TaskSkipped, state.iteration, now)
                        .with_notes(format!("task {skipped}")),
                ];
                match &transition {
                    TaskTransition::NextTask { .. } => self.refresh_baseline(&mut state),
                    TaskTransition::BatchFinished | TaskTransition::LoopFinished => history.push(
                        HistoryEntry::new(HistoryEvent::BatchCompleted, state.iteration, now),
                    ),
                }
                store.save(&state)?;
                store.append_history_all(&history)?;
                info!(skipped = %skipped, ?transition, "task skipped");
                Ok(transition)
            })?
            .ok_or(LoopError::NoActiveLoop)
    }

    /// Current loop snapshot, or `None` when no loop exists.
    pub fn status(&self) -> LoopResult<Option<StatusReport>> {
        self.read_snapshot(|store| {
            let state = match store.load()? {
                Loaded::Missing => return Ok(None),
                Loaded::Corrupted { reason } => {
                    return Err(LoopError::Corrupted {
                        path: store.paths().state_path.clone(),
                        reason,
                    });
                }
                Loaded::Present(state) => state,
            };
            let queue = self.load_queue(&state)?;
            let prompt = match &queue {
                Some(queue) => Some(queue.current().prompt.clone()),
                None => store.load_prompt()?,
            };
            Ok(Some(StatusReport {
                current_task: queue.as_ref().map(|queue| queue.current().clone()),
                task_number: queue.as_ref().map(|queue| queue.position() + 1),
                prompt,
                history_entries: store.history_len()?,
                state,
            }))
        })
    }

    /// Prompt the agent should be working on right now.
    pub fn current_prompt(&self) -> LoopResult<String> {
        self.read_snapshot(|store| {
            let state = store.load_required()?;
            if !state.active {
                return Err(LoopError::NoActiveLoop);
            }
            let queue = self.load_queue(&state)?;
            self.prompt_for(queue.as_ref())
        })
    }

    pub fn history(&self) -> LoopResult<Vec<HistoryEntry>> {
        Ok(self.store.read_history()?)
    }

    /// Look up a batch task by id or title.
    pub fn find_task(&self, query: &str) -> LoopResult<Option<Task>> {
        self.read_snapshot(|store| {
            let state = store.load_required()?;
            let queue = self
                .load_queue(&state)?
                .ok_or(LoopError::WrongMode { operation: "task" })?;
            Ok(queue.get_task(query).cloned())
        })
    }

    /// Apply a detected promise to in-memory state.
    ///
    /// Returns the outcome and the history to append once the state is saved;
    /// an empty history means nothing changed.
    pub(crate) fn apply_completion(
        &self,
        state: &mut LoopState,
        queue: Option<&mut TaskQueue>,
        output: &str,
        now: DateTime<Utc>,
    ) -> (CompleteOutcome, Vec<HistoryEntry>) {
        if !state.active {
            return (CompleteOutcome::AlreadyFinished, Vec::new());
        }
        if !promise::detect_configured(output, state.completion_promise.as_deref()) {
            return (CompleteOutcome::NotComplete, Vec::new());
        }
        if self.completion_guard
            && let Some(baseline) = state.baseline_fingerprint.as_deref()
            && self.fingerprint().as_deref() == Some(baseline)
        {
            info!("completion promise refused: workspace unchanged");
            return (CompleteOutcome::NoObservableChange, Vec::new());
        }

        let finished = state.current_task_id.clone().unwrap_or_default();
        match finish_task(state, queue) {
            TaskTransition::LoopFinished => {
                info!(iteration = state.iteration, "loop completed");
                (
                    CompleteOutcome::Completed {
                        iteration: state.iteration,
                    },
                    vec![
                        HistoryEntry::new(HistoryEvent::Completed, state.iteration, now)
                            .with_notes("completion promise detected"),
                    ],
                )
            }
            TaskTransition::NextTask { task_id, .. } => {
                self.refresh_baseline(state);
                info!(finished = %finished, next = %task_id, "task completed");
                (
                    CompleteOutcome::TaskCompleted {
                        task_id: finished.clone(),
                        next_task_id: task_id,
                    },
                    vec![
                        HistoryEntry::new(HistoryEvent::TaskCompleted, state.iteration, now)
                            .with_notes(format!("task {finished}")),
                    ],
                )
            }
            TaskTransition::BatchFinished => {
                info!(finished = %finished, "batch completed");
                (
                    CompleteOutcome::BatchCompleted {
                        task_id: finished.clone(),
                    },
                    vec![
                        HistoryEntry::new(HistoryEvent::TaskCompleted, state.iteration, now)
                            .with_notes(format!("task {finished}")),
                        HistoryEntry::new(HistoryEvent::BatchCompleted, state.iteration, now),
                    ],
                )
            }
        }
    }

    /// Rebuild the batch queue; `None` in single mode.
    pub(crate) fn load_queue(&self, state: &LoopState) -> LoopResult<Option<TaskQueue>> {
        let Some(progress) = state.batch.as_ref() else {
            return Ok(None);
        };
        let tasks = self.store.load_tasks_required()?;
        TaskQueue::resume(tasks, progress)
            .map(Some)
            .ok_or_else(|| LoopError::Corrupted {
                path: self.store.paths().tasks_path.clone(),
                reason: "task list does not match the persisted cursor".to_string(),
            })
    }

    /// The prompt for the current cycle: the current task in batch mode,
    /// `prompt.md` otherwise.
    pub(crate) fn prompt_for(&self, queue: Option<&TaskQueue>) -> LoopResult<String> {
        if let Some(queue) = queue {
            return Ok(queue.current().prompt.clone());
        }
        self.store
            .load_prompt()?
            .ok_or_else(|| LoopError::Corrupted {
                path: self.store.paths().prompt_path.clone(),
                reason: "prompt file is missing".to_string(),
            })
    }

    /// Whether completion on an unchanged workspace is refused for `state`.
    fn guards_changes(&self, state: &LoopState) -> bool {
        self.completion_guard && state.baseline_fingerprint.is_some()
    }

    /// Record the workspace fingerprint a new task starts from.
    pub(crate) fn refresh_baseline(&self, state: &mut LoopState) {
        state.baseline_fingerprint = self.fingerprint();
    }

    fn fingerprint(&self) -> Option<String> {
        match workspace::fingerprint(self.store.paths().root()) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "workspace fingerprint unavailable");
                None
            }
        }
    }

    /// Lock-free read. Every document is replaced atomically, so the only
    /// hazard is pairing `state.json` with companions from another version;
    /// that shows up as `Corrupted` and is retried once under the lock.
    fn read_snapshot<T>(&self, f: impl Fn(&StateStore) -> LoopResult<T>) -> LoopResult<T> {
        match f(&self.store) {
            Err(LoopError::Corrupted { .. }) if self.store.paths().state_dir.exists() => {
                debug!("inconsistent snapshot; re-reading under the lock");
                self.store.with_lock(f)
            }
            result => result,
        }
    }
}

/// A finished or corrupted loop may be replaced; a running one may not.
fn ensure_replaceable(store: &StateStore) -> LoopResult<()> {
    match store.load()? {
        Loaded::Present(state) if state.active => Err(LoopError::AlreadyActive {
            iteration: state.iteration,
        }),
        Loaded::Corrupted { reason } => {
            warn!(reason = %reason, "replacing corrupted loop state");
            Ok(())
        }
        Loaded::Present(_) | Loaded::Missing => Ok(()),
    }
}
