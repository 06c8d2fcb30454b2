//! Agent abstraction for the `run` driver.
//!
//! The [`Agent`] trait decouples the loop driver from the actual agent
//! backend. Tests use scripted agents that return canned output without
//! spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one agent cycle.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    pub timeout: Duration,
    /// Keep at most this many bytes of agent stdout.
    pub output_limit_bytes: usize,
}

/// What one agent cycle produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    /// Agent stdout, scanned for the completion promise.
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Abstraction over agent execution backends.
pub trait Agent {
    /// Run one cycle. A failing or timed-out agent still yields whatever it
    /// printed; only a failure to launch it is an error.
    fn run(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Agent launched from a configured argv, prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    argv: Vec<String>,
}

impl CommandAgent {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("agent command must be a non-empty array"));
        }
        Ok(Self { argv })
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(program = %self.argv[0], timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]).current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.clone().into_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run agent {}", self.argv.join(" ")))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        } else if !output.status.success() {
            warn!(
                exit_code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "agent exited with failure"
            );
        }
        debug!(stdout_bytes = output.stdout.len(), "agent finished");
        Ok(AgentRun {
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_argv() {
        assert!(CommandAgent::new(Vec::new()).is_err());
        assert!(CommandAgent::new(vec![" ".to_string()]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_echoes_prompt_through_cat() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(vec!["cat".to_string()]).expect("agent");
        let run = agent
            .run(&AgentRequest {
                workdir: temp.path().to_path_buf(),
                prompt: "do the thing".to_string(),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1_000,
            })
            .expect("run");
        assert_eq!(run.output, "do the thing");
        assert_eq!(run.exit_code, Some(0));
        assert!(!run.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn failing_agent_still_returns_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo partial; exit 3".to_string(),
        ])
        .expect("agent");
        let run = agent
            .run(&AgentRequest {
                workdir: temp.path().to_path_buf(),
                prompt: String::new(),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1_000,
            })
            .expect("run");
        assert_eq!(run.output.trim(), "partial");
        assert_eq!(run.exit_code, Some(3));
    }
}
