//! Iteration-loop control plane for autonomous coding agents.
//!
//! A loop keeps an agent working on one prompt (or a queue of tasks) by
//! intercepting each attempt to end the session: the exit is blocked and the
//! prompt re-injected until the agent emits its completion promise, the
//! iteration limit is reached, or the loop is disabled. All state lives in
//! `.ralph-mode/` inside the workspace and is shared safely between
//! concurrent processes.
//!
//! - **[`core`]**: Pure state transitions, promise detection, task queue and
//!   exit-decision types. No I/O.
//! - **[`io`]**: Filesystem, locking, git, processes and network probes.
//!
//! Orchestration modules ([`controller`], [`intercept`], [`outage`],
//! [`looping`]) combine the two to implement the CLI commands.

pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod intercept;
pub mod io;
pub mod logging;
pub mod looping;
pub mod outage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
