//! Canonical on-disk layout of a workspace.

use std::path::{Path, PathBuf};

/// Name of the state directory inside a workspace.
pub const STATE_DIR_NAME: &str = ".ralph-mode";
/// Name of the optional user configuration file at the workspace root.
pub const CONFIG_FILE_NAME: &str = "ralph-mode.toml";

/// All canonical paths for a workspace root.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub lock_path: PathBuf,
    pub state_path: PathBuf,
    pub prompt_path: PathBuf,
    pub tasks_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub history_path: PathBuf,
    pub instructions_path: PathBuf,
    pub config_path: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR_NAME);
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            lock_path: state_dir.join(".lock"),
            state_path: state_dir.join("state.json"),
            prompt_path: state_dir.join("prompt.md"),
            tasks_path: state_dir.join("tasks.json"),
            tasks_dir: state_dir.join("tasks"),
            history_path: state_dir.join("history.jsonl"),
            instructions_path: state_dir.join("INSTRUCTIONS.md"),
            config_path: root.join(CONFIG_FILE_NAME),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = RalphPaths::new("/work");
        assert!(paths.state_path.ends_with(".ralph-mode/state.json"));
        assert!(paths.lock_path.ends_with(".ralph-mode/.lock"));
        assert!(paths.history_path.ends_with(".ralph-mode/history.jsonl"));
        assert!(paths.tasks_dir.ends_with(".ralph-mode/tasks"));
        assert_eq!(paths.config_path, Path::new("/work/ralph-mode.toml"));
    }
}
