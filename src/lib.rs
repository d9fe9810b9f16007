//! Task Agent - remote task dispatcher
//!
//! Watches a control server's task queue and executes every newly created
//! or updated task at most once concurrently, reporting each state
//! transition back to the server.
//!
//! Data flows one way through the components:
//! [`client::TaskWatcher`] -> [`dispatcher::Dispatcher`] ->
//! [`executor::WorkerPool`] -> [`executor::TaskExecutor`] ->
//! [`client::StateClient`].

pub mod agent;
pub mod callables;
pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod logging;
pub mod types;

pub use agent::Agent;
pub use error::{Error, Result};
