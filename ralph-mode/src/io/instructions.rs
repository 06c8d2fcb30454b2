//! Human-facing files rendered into `.ralph-mode/`.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;

use crate::core::types::{LoopState, Task};

const INSTRUCTIONS_TEMPLATE: &str = include_str!("templates/instructions.md");

static SLUG_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9._-]+").expect("valid slug regex"));
static REPEATED_DASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("valid dash regex"));

/// Render `INSTRUCTIONS.md` for a freshly created loop.
///
/// `change_guard` says whether completion without a workspace change is
/// refused for this loop.
pub fn render_instructions(state: &LoopState, change_guard: bool) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("instructions", INSTRUCTIONS_TEMPLATE)?;
    let batch = state.batch.as_ref();
    let rendered = env.get_template("instructions")?.render(context! {
        batch => state.is_batch(),
        max_iterations => state.max_iterations,
        task_max_iterations => batch.map_or(0, |progress| progress.task_max_iterations),
        tasks_total => batch.map_or(0, |progress| progress.tasks_total),
        completion_promise => state.completion_promise.as_deref(),
        change_guard,
    })?;
    Ok(rendered)
}

/// File name for the task at zero-based `index`, e.g. `01-task-001.md`.
pub fn task_file_name(index: usize, task: &Task) -> String {
    let base = if task.id.trim().is_empty() {
        &task.title
    } else {
        &task.id
    };
    format!("{:02}-{}.md", index + 1, slugify(base))
}

/// Markdown body of a task file.
pub fn render_task_file(task: &Task) -> String {
    format!("# {} — {}\n\n{}\n", task.id, task.title, task.prompt)
}

/// Filesystem-safe lowercase slug; `task` when nothing usable remains.
pub fn slugify(text: &str) -> String {
    let replaced = SLUG_SEPARATORS.replace_all(text.trim(), "-");
    let collapsed = REPEATED_DASHES.replace_all(&replaced, "-");
    let slug = collapsed.trim_matches('-').to_lowercase();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}
