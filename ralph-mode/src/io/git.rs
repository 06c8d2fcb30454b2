//! Read-only git queries used to fingerprint the workspace.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path relative to the repository root.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True when `workdir` is inside a git work tree. A missing `git` binary
    /// counts as "not a repository".
    #[instrument(skip_all)]
    pub fn is_work_tree(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(err) => {
                debug!(err = %err, "git unavailable");
                false
            }
        }
    }

    /// Full HEAD sha, or `None` in a repository without commits.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    ///
    /// Uses `-z` so paths arrive verbatim, without C-style quoting.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?;
        parse_porcelain_z(&out)
    }

    /// Absolute path of the repository root.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_porcelain_z(out: &str) -> Result<Vec<StatusEntry>> {
    let mut records = out.split('\0').filter(|record| !record.is_empty());
    let mut entries = Vec::new();
    while let Some(record) = records.next() {
        if record.len() < 4 || record.as_bytes()[2] != b' ' {
            return Err(anyhow!("unexpected porcelain record: '{record}'"));
        }
        let code = &record[..2];
        // Renames and copies carry the source path as the next record.
        if code.contains(['R', 'C']) {
            records.next();
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: record[3..].to_string(),
        });
    }
    Ok(entries)
}
