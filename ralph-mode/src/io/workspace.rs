//! Workspace fingerprint for the no-observable-change completion guard.
//!
//! The fingerprint hashes the git HEAD plus every changed or untracked path
//! (and its current contents) outside the state directory. Two equal
//! fingerprints mean the agent left no trace in the repository.

use std::fs;
use std::path::{Component, Path};

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::io::git::Git;
use crate::io::paths::STATE_DIR_NAME;

/// Fingerprint of `root`, or `None` when it is not inside a git work tree.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn fingerprint(root: &Path) -> Result<Option<String>> {
    let git = Git::new(root);
    if !git.is_work_tree() {
        debug!("not a git work tree; fingerprint disabled");
        return Ok(None);
    }
    let toplevel = git.toplevel()?;
    let mut entries: Vec<_> = git
        .status_porcelain()?
        .into_iter()
        .filter(|entry| !is_state_path(&entry.path))
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    hasher.update(b"head:");
    hasher.update(git.head_sha()?.unwrap_or_default().as_bytes());
    for entry in &entries {
        hasher.update(b"\nentry:");
        hasher.update(entry.code.as_bytes());
        hasher.update(b" ");
        hasher.update(entry.path.as_bytes());
        match fs::read(toplevel.join(&entry.path)) {
            Ok(contents) => {
                hasher.update(b"\ncontents:");
                hasher.update(Sha256::digest(&contents));
            }
            Err(err) => {
                debug!(path = %entry.path, err = %err, "unreadable status path");
                hasher.update(b"\nunreadable:");
                hasher.update(format!("{:?}", err.kind()).as_bytes());
            }
        }
    }
    let digest = hex::encode(hasher.finalize());
    debug!(entries = entries.len(), fingerprint = %digest, "workspace fingerprint");
    Ok(Some(digest))
}

fn is_state_path(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|component| matches!(component, Component::Normal(name) if name == STATE_DIR_NAME))
}
