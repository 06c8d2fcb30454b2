//! Deterministic, pure logic shared by the loop controller and the exit hook.
//!
//! Core modules must be free of I/O side effects. Timestamps are passed in by
//! the caller so every transition is reproducible in tests.

pub mod cycle;
pub mod decision;
pub mod promise;
pub mod task_queue;
pub mod types;
