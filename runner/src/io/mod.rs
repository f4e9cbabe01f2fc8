//! Side-effecting operations: filesystem, git, processes, state persistence.

pub mod config;
pub mod context;
pub mod events;
pub mod git;
pub mod init;
pub mod process;
pub mod project;
pub mod prompt;
pub mod state_store;
pub mod task_log;
pub mod validator;
pub mod worker;
