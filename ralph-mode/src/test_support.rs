//! Test-only helpers: temp workspaces and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use crate::controller::LoopController;
use crate::core::types::Task;
use crate::io::agent::{Agent, AgentRequest, AgentRun};
use crate::io::connectivity::ConnectivityProbe;
use crate::io::paths::RalphPaths;
use crate::io::state_store::StateStore;
use crate::outage::{OutageSummary, OutageWait, WaitNotifier};

/// Lock wait used by test controllers.
pub const TEST_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A temporary workspace directory, removed on drop.
pub struct TempWorkspace {
    dir: TempDir,
}

impl TempWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp workspace"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> RalphPaths {
        RalphPaths::new(self.path())
    }

    /// Controller for this workspace with a generous lock bound.
    pub fn controller(&self) -> LoopController {
        LoopController::new(StateStore::new(self.paths(), TEST_LOCK_TIMEOUT))
    }
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a deterministic task: title `"<id> title"`, prompt `"<id> prompt"`.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        prompt: format!("{id} prompt"),
        file: None,
    }
}

/// Agent that replays canned outputs; the last one repeats forever.
pub struct ScriptedAgent {
    outputs: RefCell<VecDeque<String>>,
    last: RefCell<String>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outputs: RefCell::new(outputs.into_iter().map(Into::into).collect()),
            last: RefCell::new(String::new()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        if let Some(next) = self.outputs.borrow_mut().pop_front() {
            *self.last.borrow_mut() = next;
        }
        Ok(AgentRun {
            output: self.last.borrow().clone(),
            exit_code: Some(0),
            timed_out: false,
        })
    }
}

/// Probe that replays a connectivity script; the last answer repeats.
pub struct ScriptedProbe {
    answers: Vec<bool>,
    next: Cell<usize>,
}

impl ScriptedProbe {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        let answers: Vec<bool> = answers.into_iter().collect();
        assert!(!answers.is_empty(), "probe script must not be empty");
        Self {
            answers,
            next: Cell::new(0),
        }
    }
}

impl ConnectivityProbe for ScriptedProbe {
    fn is_online(&self) -> bool {
        let index = self.next.get().min(self.answers.len() - 1);
        self.next.set(self.next.get() + 1);
        self.answers[index]
    }
}

/// Notifier that records every callback.
#[derive(Default)]
pub struct RecordingNotifier {
    waits: RefCell<Vec<OutageWait>>,
    resumed: RefCell<Vec<OutageSummary>>,
}

impl RecordingNotifier {
    pub fn waits(&self) -> Vec<OutageWait> {
        self.waits.borrow().clone()
    }

    pub fn resumed_count(&self) -> usize {
        self.resumed.borrow().len()
    }
}

impl WaitNotifier for RecordingNotifier {
    fn waiting(&self, wait: &OutageWait) {
        self.waits.borrow_mut().push(*wait);
    }

    fn resumed(&self, summary: &OutageSummary) {
        self.resumed.borrow_mut().push(*summary);
    }
}
