//! Run orchestration engine for agent tasks.
//!
//! Executes a dependency graph of tasks by dispatching each to an external
//! agent process, with a concurrency ceiling, retries, and pause/stop
//! control. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (readiness, retry policy, output
//!   assessment, state transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, agent processes,
//!   state persistence).
//!
//! Orchestration modules ([`control`], [`orchestrator`], [`start`]) coordinate
//! core logic with I/O to execute runs.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
