//! Hook input parsing and transcript scanning.
//!
//! The agent runtime invokes the exit hook with a JSON object on stdin. The
//! fields used here are `transcript_path` (a JSONL session transcript) and
//! `last_assistant_message`; anything else is ignored. Input that cannot be
//! parsed is treated as empty so the hook can still decide.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Exit-hook input object.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HookInput {
    /// Working directory of the agent session.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
    #[serde(default)]
    pub last_assistant_message: Option<String>,
}

impl HookInput {
    /// Parse hook stdin; blank or malformed input yields an empty input.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(raw) {
            Ok(input) => input,
            Err(err) => {
                warn!(err = %err, "ignoring malformed hook input");
                Self::default()
            }
        }
    }

    /// The agent's final message, preferring the explicit field over the
    /// transcript. An unreadable transcript counts as "no output".
    pub fn agent_output(&self) -> Option<String> {
        if let Some(message) = self
            .last_assistant_message
            .as_ref()
            .filter(|m| !m.trim().is_empty())
        {
            return Some(message.clone());
        }
        let path = self.transcript_path.as_deref()?;
        match last_assistant_text(path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "transcript unreadable");
                None
            }
        }
    }
}

/// Text of the last assistant message in a JSONL transcript.
pub fn last_assistant_text(path: &Path) -> Result<Option<String>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read transcript {}", path.display()))?;
    let mut last = None;
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                debug!(line = index + 1, err = %err, "skipping transcript line");
                continue;
            }
        };
        if let Some(text) = assistant_text(&record) {
            last = Some(text);
        }
    }
    Ok(last)
}

fn assistant_text(record: &Value) -> Option<String> {
    let message = record.get("message").unwrap_or(record);
    let is_assistant = record.get("type").and_then(Value::as_str) == Some("assistant")
        || message.get("role").and_then(Value::as_str) == Some("assistant");
    if !is_assistant {
        return None;
    }
    let text = match message.get("content")? {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    (!text.trim().is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_input_is_empty() {
        assert_eq!(HookInput::parse(""), HookInput::default());
        assert_eq!(HookInput::parse("not json"), HookInput::default());
        let input = HookInput::parse(
            r#"{"session_id":"s1","cwd":"/work","stop_hook_active":true,"extra":1}"#,
        );
        assert_eq!(input.cwd.as_deref(), Some(Path::new("/work")));
    }

    #[test]
    fn picks_last_assistant_text_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcript.jsonl");
        let lines = [
            r#"{"type":"user","message":{"role":"user","content":"please finish"}}"#,
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"working"}]}}"#,
            "garbage",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","name":"Bash"}]}}"#,
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"all done"},{"type":"text","text":"<promise>DONE</promise>"}]}}"#,
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","content":"ok"}]}}"#,
        ];
        fs::write(&path, lines.join("\n")).expect("write");

        let text = last_assistant_text(&path).expect("read");
        assert_eq!(text.as_deref(), Some("all done\n<promise>DONE</promise>"));
    }

    #[test]
    fn explicit_message_wins_and_missing_transcript_is_none() {
        let input = HookInput {
            last_assistant_message: Some("<promise>X</promise>".to_string()),
            transcript_path: Some(PathBuf::from("/nonexistent/t.jsonl")),
            ..HookInput::default()
        };
        assert_eq!(input.agent_output().as_deref(), Some("<promise>X</promise>"));

        let input = HookInput {
            transcript_path: Some(PathBuf::from("/nonexistent/t.jsonl")),
            ..HookInput::default()
        };
        assert_eq!(input.agent_output(), None);
    }
}
