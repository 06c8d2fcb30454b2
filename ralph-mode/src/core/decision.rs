//! Exit-interception decision and its wire format.
//!
//! The hosting agent runtime calls the hook when the agent tries to end its
//! session and expects exactly one JSON object on stdout:
//!
//! - block: `{"decision":"block","reason":"<prompt>","systemMessage":"<status>"}`
//! - allow: `{}` or `{"systemMessage":"<status>"}`

use serde::{Deserialize, Serialize};

use crate::core::types::{LoopState, Task};

/// Why an exit attempt was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    /// No persisted loop.
    NoLoop,
    /// Persisted state is unreadable; allowing is the fail-open default.
    Corrupted,
    /// The loop already finished or was disabled.
    Inactive,
    /// `max_iterations` reached.
    LimitReached,
    /// Completion promise detected in single mode.
    Completed,
    /// The last batch task finished.
    BatchComplete,
}

/// Decision returned for one exit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
    Allow {
        reason: AllowReason,
        message: Option<String>,
    },
    /// Keep the session alive and re-inject `prompt`.
    Block { prompt: String, banner: String },
}

impl ExitDecision {
    pub fn allow(reason: AllowReason, message: Option<String>) -> Self {
        ExitDecision::Allow { reason, message }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, ExitDecision::Block { .. })
    }

    /// Serialize to the hook response object.
    pub fn to_response(&self) -> HookResponse {
        match self {
            ExitDecision::Allow { message, .. } => HookResponse {
                decision: None,
                reason: None,
                system_message: message.clone(),
            },
            ExitDecision::Block { prompt, banner } => HookResponse {
                decision: Some("block".to_string()),
                reason: Some(prompt.clone()),
                system_message: Some(banner.clone()),
            },
        }
    }
}

/// JSON object printed by `ralph-mode hook`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HookResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(
        rename = "systemMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_message: Option<String>,
}

/// Current task and its 1-based position, for banners and status output.
#[derive(Debug, Clone, Copy)]
pub struct TaskPosition<'a> {
    pub task: &'a Task,
    pub number: usize,
    pub total: usize,
}

/// One-line status shown to the agent alongside the re-injected prompt.
pub fn iteration_banner(state: &LoopState, task: Option<TaskPosition<'_>>) -> String {
    let limit = if state.max_iterations > 0 {
        state.max_iterations.to_string()
    } else {
        "∞".to_string()
    };
    let mut banner = format!("🔄 Ralph iteration {}/{limit}", state.iteration);
    if let Some(position) = task {
        banner.push_str(&format!(
            " | task {}/{} {}",
            position.number, position.total, position.task.id
        ));
    }
    match state.completion_promise.as_deref() {
        Some(promise) => banner.push_str(&format!(
            " | To stop: output <promise>{promise}</promise> (ONLY when TRUE)"
        )),
        None => banner.push_str(" | No completion promise set; loop runs until the iteration limit"),
    }
    banner
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn state(max: u32, promise: Option<&str>) -> LoopState {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        LoopState::single(max, promise.map(str::to_string), now)
    }

    #[test]
    fn block_response_is_bit_exact() {
        let decision = ExitDecision::Block {
            prompt: "Fix the tests".to_string(),
            banner: "🔄 Ralph iteration 2/5".to_string(),
        };
        let json = serde_json::to_string(&decision.to_response()).expect("serialize");
        assert_eq!(
            json,
            r#"{"decision":"block","reason":"Fix the tests","systemMessage":"🔄 Ralph iteration 2/5"}"#
        );
    }

    #[test]
    fn allow_response_is_empty_or_message_only() {
        let silent = ExitDecision::allow(AllowReason::NoLoop, None);
        assert_eq!(
            serde_json::to_string(&silent.to_response()).expect("serialize"),
            "{}"
        );

        let noisy = ExitDecision::allow(AllowReason::LimitReached, Some("limit".to_string()));
        assert_eq!(
            serde_json::to_string(&noisy.to_response()).expect("serialize"),
            r#"{"systemMessage":"limit"}"#
        );
    }

    #[test]
    fn banner_mentions_limit_and_promise() {
        let mut s = state(10, Some("DONE"));
        s.iteration = 3;
        let banner = iteration_banner(&s, None);
        assert!(banner.starts_with("🔄 Ralph iteration 3/10"));
        assert!(banner.contains("<promise>DONE</promise>"));

        let banner = iteration_banner(&state(0, None), None);
        assert!(banner.contains("1/∞"));
        assert!(banner.contains("No completion promise set"));
    }

    #[test]
    fn banner_includes_task_position() {
        let task = Task {
            id: "T2".to_string(),
            title: "two".to_string(),
            prompt: "do two".to_string(),
            file: None,
        };
        let banner = iteration_banner(
            &state(0, None),
            Some(TaskPosition {
                task: &task,
                number: 2,
                total: 3,
            }),
        );
        assert!(banner.contains("task 2/3 T2"));
    }
}
