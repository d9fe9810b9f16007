//! Callable registry
//!
//! Tasks name the code they run by a dotted `module.attribute` method path.
//! Every callable the agent can run is registered here at startup:
//! - Method paths are validated when registered
//! - Unknown paths are rejected before any process is spawned
//! - Callables write their output to an injected writer

mod builtins;
mod registry;

pub use builtins::register_builtins;
pub use registry::*;
