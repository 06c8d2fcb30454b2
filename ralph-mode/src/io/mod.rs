//! I/O helpers for loop commands.

pub mod agent;
pub mod config;
pub mod connectivity;
pub mod git;
pub mod history;
pub mod instructions;
pub mod lock;
pub mod paths;
pub mod process;
pub mod state_store;
pub mod tasks_file;
pub mod transcript;
pub mod workspace;
