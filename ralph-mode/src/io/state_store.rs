//! Durable loop state in `.ralph-mode/`.
//!
//! `state.json` is the commit point: it is written last when a loop is created
//! and removed first when a loop is disabled, so a partially created or
//! partially removed loop is never observed as active. Every document is
//! replaced atomically (temp file, fsync, rename), so a reader sees either the
//! previous or the next version.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::core::types::{HistoryEntry, LoopMode, LoopState, Task};
use crate::error::{LoopError, LoopResult};
use crate::io::history;
use crate::io::lock::StateLock;
use crate::io::paths::RalphPaths;

/// Result of reading a persisted document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<T> {
    Missing,
    Corrupted { reason: String },
    Present(T),
}

impl<T> Loaded<T> {
    pub fn present(self) -> Option<T> {
        match self {
            Loaded::Present(value) => Some(value),
            Loaded::Missing | Loaded::Corrupted { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    paths: RalphPaths,
    lock_timeout: Duration,
}

impl StateStore {
    pub fn new(paths: RalphPaths, lock_timeout: Duration) -> Self {
        Self {
            paths,
            lock_timeout,
        }
    }

    pub fn paths(&self) -> &RalphPaths {
        &self.paths
    }

    /// Run `f` while holding the exclusive state lock.
    pub fn with_lock<T>(&self, f: impl FnOnce(&Self) -> LoopResult<T>) -> LoopResult<T> {
        let _lock = StateLock::acquire(&self.paths.lock_path, self.lock_timeout)?;
        f(self)
    }

    /// Like [`Self::with_lock`], but only in a workspace that has a state
    /// directory. Returns `None` without touching the disk otherwise, so
    /// operations on a workspace without a loop leave no trace.
    pub fn with_existing_lock<T>(
        &self,
        f: impl FnOnce(&Self) -> LoopResult<T>,
    ) -> LoopResult<Option<T>> {
        if !self.paths.state_dir.exists() {
            debug!("no state directory; skipping lock");
            return Ok(None);
        }
        self.with_lock(f).map(Some)
    }

    /// Read `state.json`. Unparseable or inconsistent state is reported as
    /// corrupted, never repaired with guessed values.
    #[instrument(skip_all)]
    pub fn load(&self) -> Result<Loaded<LoopState>> {
        let loaded = read_json::<LoopState>(&self.paths.state_path)?;
        Ok(match loaded {
            Loaded::Present(state) => match validate_state(&state) {
                Ok(()) => Loaded::Present(state),
                Err(reason) => {
                    warn!(reason = %reason, "state failed consistency check");
                    Loaded::Corrupted { reason }
                }
            },
            other => other,
        })
    }

    /// Like [`load`](Self::load), mapping absence and corruption to errors.
    pub fn load_required(&self) -> LoopResult<LoopState> {
        match self.load()? {
            Loaded::Present(state) => Ok(state),
            Loaded::Missing => Err(LoopError::NoActiveLoop),
            Loaded::Corrupted { reason } => Err(LoopError::Corrupted {
                path: self.paths.state_path.clone(),
                reason,
            }),
        }
    }

    pub fn save(&self, state: &LoopState) -> Result<()> {
        debug!(
            iteration = state.iteration,
            active = state.active,
            "saving state"
        );
        write_json_atomic(&self.paths.state_path, state)
    }

    pub fn load_tasks(&self) -> Result<Loaded<Vec<Task>>> {
        read_json(&self.paths.tasks_path)
    }

    /// Load the batch task list, treating absence as corruption of the loop.
    pub fn load_tasks_required(&self) -> LoopResult<Vec<Task>> {
        let reason = match self.load_tasks()? {
            Loaded::Present(tasks) => return Ok(tasks),
            Loaded::Missing => "batch loop has no task list".to_string(),
            Loaded::Corrupted { reason } => reason,
        };
        Err(LoopError::Corrupted {
            path: self.paths.tasks_path.clone(),
            reason,
        })
    }

    pub fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        write_json_atomic(&self.paths.tasks_path, &tasks)
    }

    pub fn load_prompt(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.paths.prompt_path) {
            Ok(prompt) => Ok(Some(prompt)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("read {}", self.paths.prompt_path.display()))
            }
        }
    }

    pub fn save_prompt(&self, prompt: &str) -> Result<()> {
        write_atomic(&self.paths.prompt_path, prompt.as_bytes())
    }

    pub fn write_instructions(&self, contents: &str) -> Result<()> {
        write_atomic(&self.paths.instructions_path, contents.as_bytes())
    }

    /// Root-relative path (with `/` separators) of the task file `name`.
    pub fn task_file_path(&self, name: &str) -> String {
        let path = self.paths.tasks_dir.join(name);
        path.strip_prefix(&self.paths.root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub fn write_task_file(&self, name: &str, contents: &str) -> Result<()> {
        write_atomic(&self.paths.tasks_dir.join(name), contents.as_bytes())
    }

    pub fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        fs::create_dir_all(&self.paths.state_dir)
            .with_context(|| format!("create {}", self.paths.state_dir.display()))?;
        history::append_entry(&self.paths.history_path, entry)
    }

    pub fn append_history_all(&self, entries: &[HistoryEntry]) -> Result<()> {
        for entry in entries {
            self.append_history(entry)?;
        }
        Ok(())
    }

    /// Replace the history log with a single first record.
    pub fn reset_history(&self, first: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_string(first).context("serialize history entry")?;
        line.push('\n');
        write_atomic(&self.paths.history_path, line.as_bytes())
    }

    pub fn read_history(&self) -> Result<Vec<HistoryEntry>> {
        history::read_entries(&self.paths.history_path)
    }

    pub fn history_len(&self) -> Result<usize> {
        history::count_entries(&self.paths.history_path)
    }

    /// Remove `state.json` first, then every companion artifact. The lock
    /// file is kept because other processes may be waiting on it.
    ///
    /// Returns whether a state document existed.
    #[instrument(skip_all)]
    pub fn clear(&self) -> Result<bool> {
        let existed = remove_file_if_exists(&self.paths.state_path)?;
        self.clear_companions()?;
        Ok(existed)
    }

    /// Remove companions a freshly committed loop of `mode` does not use:
    /// the other mode's documents and task files outside `task_files`.
    #[instrument(skip_all, fields(mode = mode.as_str()))]
    pub fn remove_stale(&self, mode: LoopMode, task_files: &[String]) -> Result<()> {
        if mode == LoopMode::Batch {
            remove_file_if_exists(&self.paths.prompt_path)?;
        } else {
            remove_file_if_exists(&self.paths.tasks_path)?;
        }
        let entries = match fs::read_dir(&self.paths.tasks_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read {}", self.paths.tasks_dir.display()));
            }
        };
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.paths.tasks_dir.display()))?;
            let keep = entry
                .file_name()
                .to_str()
                .is_some_and(|name| task_files.iter().any(|kept| kept == name));
            if !keep {
                debug!(path = %entry.path().display(), "removing stale task file");
                remove_file_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }

    /// Remove everything except `state.json` and the lock file.
    pub fn clear_companions(&self) -> Result<()> {
        for path in [
            &self.paths.prompt_path,
            &self.paths.tasks_path,
            &self.paths.history_path,
            &self.paths.instructions_path,
        ] {
            remove_file_if_exists(path)?;
        }
        match fs::remove_dir_all(&self.paths.tasks_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("remove {}", self.paths.tasks_dir.display()))
            }
        }
    }
}

/// Structural checks serde cannot express.
fn validate_state(state: &LoopState) -> std::result::Result<(), String> {
    if state.iteration == 0 {
        return Err("iteration must be at least 1".to_string());
    }
    match (state.mode, &state.batch, &state.current_task_id) {
        (LoopMode::Single, None, None) => Ok(()),
        (LoopMode::Single, _, _) => Err("single-mode state carries batch fields".to_string()),
        (LoopMode::Batch, Some(progress), Some(_)) => {
            if progress.tasks_total == 0 || progress.task_index >= progress.tasks_total {
                return Err(format!(
                    "task index {} out of range for {} tasks",
                    progress.task_index, progress.tasks_total
                ));
            }
            Ok(())
        }
        (LoopMode::Batch, _, _) => Err("batch-mode state lacks task progress".to_string()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Ok(Loaded::Present(value)),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unparseable document");
            Ok(Loaded::Corrupted {
                reason: err.to_string(),
            })
        }
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    json.push('\n');
    write_atomic(path, json.as_bytes())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = temp_path(path);
    let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", tmp.display()))?;
    drop(file);
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("rename {}", path.display()));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
