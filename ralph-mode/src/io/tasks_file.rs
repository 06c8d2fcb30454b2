//! Reading the user-supplied tasks file for `batch-init`.
//!
//! Accepted shape: a non-empty JSON array whose items are either plain prompt
//! strings or objects with optional `id`, `title` and `prompt`.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::Context;
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::Task;
use crate::error::{LoopError, LoopResult};

const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTask {
    Prompt(String),
    Detailed {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },
}

/// Load, validate and normalize a tasks file.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_tasks_file(path: &Path) -> LoopResult<Vec<Task>> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if !is_json {
        return Err(LoopError::InvalidArgument(format!(
            "tasks file must be a .json file: {}",
            path.display()
        )));
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(LoopError::InvalidArgument(format!(
                "tasks file not found: {}",
                path.display()
            )));
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("read {}", path.display()))
                .into());
        }
    };
    let tasks = parse_tasks(&contents)?;
    debug!(count = tasks.len(), "loaded tasks file");
    Ok(tasks)
}

/// Parse tasks-file JSON text.
pub fn parse_tasks(contents: &str) -> LoopResult<Vec<Task>> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| LoopError::InvalidArgument(format!("tasks file is not valid JSON: {err}")))?;
    validate_schema(&value)?;
    let raw: Vec<RawTask> = serde_json::from_value(value)
        .map_err(|err| LoopError::InvalidArgument(format!("unexpected task entry: {err}")))?;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(index, raw)| normalize(index, raw))
        .collect())
}

fn validate_schema(instance: &Value) -> LoopResult<()> {
    let schema: Value = serde_json::from_str(TASKS_SCHEMA).context("parse tasks schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile tasks schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(LoopError::InvalidArgument(format!(
            "tasks file failed validation: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

fn normalize(index: usize, raw: RawTask) -> Task {
    let non_blank = |value: Option<String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let default_id = format!("TASK-{:03}", index + 1);
    match raw {
        RawTask::Prompt(prompt) => {
            let prompt = prompt.trim().to_string();
            Task {
                id: default_id,
                title: prompt.clone(),
                prompt,
                file: None,
            }
        }
        RawTask::Detailed { id, title, prompt } => {
            let id = non_blank(id).unwrap_or(default_id);
            let title = non_blank(title);
            let prompt = non_blank(prompt);
            let title = title
                .clone()
                .or_else(|| prompt.clone())
                .unwrap_or_else(|| id.clone());
            let prompt = prompt.unwrap_or_else(|| title.clone());
            Task {
                id,
                title,
                prompt,
                file: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixes_strings_and_objects() {
        let tasks = parse_tasks(
            r#"[
                "Write the README",
                {"id": "FIX-1", "title": "Fix login", "prompt": "Fix the login redirect"},
                {"title": "Only a title"},
                {"prompt": "Only a prompt"}
            ]"#,
        )
        .expect("parse");

        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["TASK-001", "FIX-1", "TASK-003", "TASK-004"]);
        assert_eq!(tasks[0].title, "Write the README");
        assert_eq!(tasks[0].prompt, "Write the README");
        assert_eq!(tasks[1].prompt, "Fix the login redirect");
        assert_eq!(tasks[2].prompt, "Only a title");
        assert_eq!(tasks[3].title, "Only a prompt");
    }

    #[test]
    fn rejects_empty_array_and_non_arrays() {
        for contents in ["[]", "{\"tasks\": []}", "[\"   \"]", "[{\"id\": \"X\"}]", "[42]"] {
            let err = parse_tasks(contents).unwrap_err();
            assert!(
                matches!(err, LoopError::InvalidArgument(_)),
                "{contents}: {err}"
            );
        }
    }

    #[test]
    fn rejects_non_json_extension_and_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let yaml = temp.path().join("tasks.yaml");
        fs::write(&yaml, "[\"a\"]").expect("write");
        assert!(matches!(
            load_tasks_file(&yaml).unwrap_err(),
            LoopError::InvalidArgument(_)
        ));
        assert!(matches!(
            load_tasks_file(&temp.path().join("absent.json")).unwrap_err(),
            LoopError::InvalidArgument(_)
        ));
    }

    #[test]
    fn loads_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        fs::write(&path, "[\"one\", \"two\"]").expect("write");
        let tasks = load_tasks_file(&path).expect("load");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].id, "TASK-002");
    }
}
