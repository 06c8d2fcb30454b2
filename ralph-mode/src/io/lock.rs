//! Cross-process exclusive lock around state mutations.
//!
//! Uses the OS advisory file lock (`flock` on Unix, `LockFileEx` on Windows),
//! which the kernel releases when the holding process exits, so a killed
//! writer never leaves the lock held. Acquisition polls with a bounded wait.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, instrument, warn};

use crate::error::{LoopError, LoopResult};

/// Delay between lock attempts while contended.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock at `path`, waiting at most `timeout`.
    #[instrument(skip_all, fields(path = %path.display(), timeout_ms = timeout.as_millis()))]
    pub fn acquire(path: &Path, timeout: Duration) -> LoopResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        let start = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => {
                    debug!(waited_ms = start.elapsed().as_millis(), "lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(TryLockError::WouldBlock) => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        warn!(waited_ms = waited.as_millis(), "lock contention exceeded bound");
                        return Err(LoopError::LockTimeout {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
                }
                Err(TryLockError::Error(err)) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("lock {}", path.display()))
                        .into());
                }
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}
