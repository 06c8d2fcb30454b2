//! Persisted data model for the loop control plane.
//!
//! These types define the on-disk contract shared by every process touching a
//! workspace (CLI commands, hook invocations, the run driver), so field names
//! and serialization must stay stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a loop re-feeds one prompt or walks a task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Single,
    Batch,
}

impl LoopMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopMode::Single => "single",
            LoopMode::Batch => "batch",
        }
    }
}

/// Batch cursor and per-task counter, persisted inside [`LoopState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Zero-based index of the current task.
    pub task_index: usize,
    /// Iterations spent on the current task (starts at 1, reset on advance).
    pub task_iteration: u32,
    /// Per-task budget; 0 means unbounded.
    pub task_max_iterations: u32,
    pub tasks_total: usize,
}

/// The single active loop of a workspace (`.ralph-mode/state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub active: bool,
    /// Global iteration counter (1-indexed, never decreases).
    pub iteration: u32,
    /// Global limit; 0 means unbounded.
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub mode: LoopMode,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_iterate_at: Option<DateTime<Utc>>,
    /// Workspace fingerprint recorded when the current task started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_fingerprint: Option<String>,
    #[serde(default)]
    pub version: String,
}

impl LoopState {
    /// Fresh single-prompt loop at iteration 1.
    pub fn single(
        max_iterations: u32,
        completion_promise: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            active: true,
            iteration: 1,
            max_iterations,
            completion_promise: normalize_promise(completion_promise),
            mode: LoopMode::Single,
            started_at: now,
            current_task_id: None,
            batch: None,
            last_iterate_at: None,
            baseline_fingerprint: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Fresh batch loop positioned on its first task.
    pub fn batch(
        max_total_iterations: u32,
        completion_promise: Option<String>,
        first_task_id: String,
        progress: BatchProgress,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            mode: LoopMode::Batch,
            current_task_id: Some(first_task_id),
            batch: Some(progress),
            ..Self::single(max_total_iterations, completion_promise, now)
        }
    }

    pub fn is_batch(&self) -> bool {
        self.mode == LoopMode::Batch
    }

    /// True once the global counter has hit a nonzero limit.
    pub fn limit_reached(&self) -> bool {
        self.max_iterations > 0 && self.iteration >= self.max_iterations
    }

    /// True once the current batch task has spent its budget.
    pub fn task_budget_exhausted(&self) -> bool {
        self.batch.as_ref().is_some_and(|progress| {
            progress.task_max_iterations > 0 && progress.task_iteration >= progress.task_max_iterations
        })
    }
}

/// Treat an empty or whitespace-only promise as "no promise".
pub fn normalize_promise(promise: Option<String>) -> Option<String> {
    promise
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

/// One batch task (`.ralph-mode/tasks.json` entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub prompt: String,
    /// Rendered task file under `.ralph-mode/tasks/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Kind of a history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    Started,
    BatchStarted,
    Iterate,
    TaskCompleted,
    TaskMaxReached,
    TaskSkipped,
    Completed,
    BatchCompleted,
    MaxReached,
    OutageWait,
    OutageResumed,
}

impl HistoryEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryEvent::Started => "started",
            HistoryEvent::BatchStarted => "batch_started",
            HistoryEvent::Iterate => "iterate",
            HistoryEvent::TaskCompleted => "task_completed",
            HistoryEvent::TaskMaxReached => "task_max_reached",
            HistoryEvent::TaskSkipped => "task_skipped",
            HistoryEvent::Completed => "completed",
            HistoryEvent::BatchCompleted => "batch_completed",
            HistoryEvent::MaxReached => "max_reached",
            HistoryEvent::OutageWait => "outage_wait",
            HistoryEvent::OutageResumed => "outage_resumed",
        }
    }
}

/// Append-only audit record (`.ralph-mode/history.jsonl`, one per line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: HistoryEvent,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl HistoryEntry {
    pub fn new(event: HistoryEvent, iteration: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            event,
            iteration,
            timestamp,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn single_state_serializes_without_batch_fields() {
        let state = LoopState::single(5, Some("DONE".to_string()), ts());
        let value = serde_json::to_value(&state).expect("serialize");

        assert_eq!(value["active"], true);
        assert_eq!(value["iteration"], 1);
        assert_eq!(value["mode"], "single");
        assert_eq!(value["completion_promise"], "DONE");
        assert!(value.get("current_task_id").is_none());
        assert!(value.get("batch").is_none());
    }

    #[test]
    fn blank_promise_means_no_promise() {
        let state = LoopState::single(0, Some("   ".to_string()), ts());
        assert_eq!(state.completion_promise, None);
    }

    #[test]
    fn limit_only_applies_when_nonzero() {
        let mut state = LoopState::single(0, None, ts());
        state.iteration = 1_000;
        assert!(!state.limit_reached());

        state.max_iterations = 3;
        state.iteration = 2;
        assert!(!state.limit_reached());
        state.iteration = 3;
        assert!(state.limit_reached());
    }

    #[test]
    fn history_entry_uses_snake_case_event_names() {
        let entry = HistoryEntry::new(HistoryEvent::TaskMaxReached, 4, ts()).with_notes("T1");
        let line = serde_json::to_string(&entry).expect("serialize");
        assert!(line.contains("\"event\":\"task_max_reached\""));
        assert!(line.contains("\"notes\":\"T1\""));
    }
}
