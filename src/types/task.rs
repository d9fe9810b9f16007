//! Task type definitions
//!
//! Mirrors the task resource served under `/v1/tasks/{id}`. The agent only
//! reads the fields it needs; anything else in the payload is ignored here
//! and preserved by the state client's read-modify-write.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a task
///
/// `Created -> Started -> {Completed, Failed}`. Both outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Task exists on the server but has not been picked up
    Created,
    /// An agent has started executing the task
    Started,
    /// The callable returned successfully
    Completed,
    /// Resolution, execution or reporting failed
    Failed,
}

impl TaskState {
    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "Created",
            TaskState::Started => "Started",
            TaskState::Completed => "Completed",
            TaskState::Failed => "Failed",
        }
    }

    /// Whether no further transition can leave this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Check whether `next` is a legal transition from this state
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Created, TaskState::Started)
                | (TaskState::Created, TaskState::Failed)
                | (TaskState::Started, TaskState::Completed)
                | (TaskState::Started, TaskState::Failed)
        )
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Created
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────

/// A unit of remote work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable unique identifier
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    /// Dotted `module.attribute` name of the callable to run
    pub method_path: String,

    /// Positional arguments for the callable
    #[serde(default)]
    pub args: Vec<Value>,

    /// Last state reported by the server
    #[serde(default)]
    pub state: TaskState,
}

impl Task {
    /// Create a task in the `Created` state
    pub fn new(id: impl Into<String>, method_path: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            method_path: method_path.into(),
            args,
            state: TaskState::Created,
        }
    }
}

/// Log file name for `task_id`
///
/// Ids that could resolve outside the task log directory are rejected.
pub fn log_file_name(task_id: &str) -> Result<String> {
    let plain = !task_id.is_empty()
        && task_id != "."
        && task_id != ".."
        && !task_id.contains(['/', '\\', '\0']);
    if !plain {
        return Err(Error::execution_failed(
            task_id,
            "task id is not usable as a log file name",
        ));
    }
    Ok(format!("{}.log", task_id))
}

/// Some servers emit numeric ids; the agent keys everything by string.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "task id must be a string or number, got {}",
            other
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
