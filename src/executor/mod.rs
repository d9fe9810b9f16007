//! Task execution
//!
//! Handles the task execution lifecycle:
//! - Claiming task ids so each runs at most once concurrently
//! - Running jobs on a bounded worker pool
//! - Running callables in an isolated context with per-task logs
//! - Reporting state transitions to the control server

mod inflight;
mod isolation;
mod pool;
mod runner;

pub use inflight::*;
pub use isolation::*;
pub use pool::*;
pub use runner::*;
