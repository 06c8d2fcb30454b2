//! Error taxonomy for loop operations.
//!
//! Orchestration code returns [`LoopError`] so callers (the CLI, the hook
//! entry point, the run driver) can tell an expected refusal apart from a
//! genuine failure. I/O and serialization problems travel inside
//! [`LoopError::Other`] with their `anyhow` context chain intact.

use std::path::PathBuf;
use std::time::Duration;

use crate::exit_codes;

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// Bad input to a creating operation; persisted state is untouched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation needs a running loop and there is none.
    #[error("no active loop (run `ralph-mode enable` first)")]
    NoActiveLoop,

    /// A creating operation would replace a loop that is still running.
    #[error("a loop is already active (iteration {iteration}); run `ralph-mode disable` first")]
    AlreadyActive { iteration: u32 },

    /// The operation does not exist for the loop's mode.
    #[error("{operation} is only available in batch mode")]
    WrongMode { operation: &'static str },

    /// A persisted document could not be parsed.
    #[error("{} is corrupted: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },

    /// The state lock stayed contended past the configured bound.
    #[error("timed out after {}ms waiting for lock {}", waited.as_millis(), path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    /// Stable process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopError::InvalidArgument(_) => exit_codes::INVALID,
            LoopError::NoActiveLoop
            | LoopError::AlreadyActive { .. }
            | LoopError::WrongMode { .. } => exit_codes::NOT_APPLICABLE,
            LoopError::Corrupted { .. } | LoopError::LockTimeout { .. } | LoopError::Other(_) => {
                exit_codes::FAILURE
            }
        }
    }
}

pub type LoopResult<T> = std::result::Result<T, LoopError>;
