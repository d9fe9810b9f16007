//! Type definitions for the task agent
//!
//! Tasks as published by the control server, and the change events
//! delivered over the watch stream.

mod event;
mod task;

pub use event::*;
pub use task::*;
