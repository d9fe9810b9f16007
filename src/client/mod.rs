//! Control server client
//!
//! - `state`: read-modify-write of a task's state field
//! - `watch`: the line-delimited task event stream

mod state;
mod watch;

pub use state::*;
pub use watch::*;
