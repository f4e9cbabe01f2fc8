//! Deterministic, pure logic shared by the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod agent_stream;
pub mod budget;
pub mod graph;
pub mod outcome;
pub mod readiness;
pub mod retry;
pub mod state_update;
pub mod types;
