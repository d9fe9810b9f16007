//! Watch stream events
//!
//! Each line of `GET /v1/tasks?watch=true` is one JSON object of the form
//! `{"type": "Created" | "Updated" | "Deleted", "data": <task>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

use super::Task;

/// Kind of change an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    /// Any type this agent does not know about
    Unknown,
}

impl EventType {
    /// Parse a wire name, case-insensitively
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "created" => EventType::Created,
            "updated" => EventType::Updated,
            "deleted" => EventType::Deleted,
            _ => EventType::Unknown,
        }
    }

    /// Whether events of this type may lead to a dispatch
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, EventType::Created | EventType::Updated)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(EventType::parse(&name))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Created => write!(f, "Created"),
            EventType::Updated => write!(f, "Updated"),
            EventType::Deleted => write!(f, "Deleted"),
            EventType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A change notification about a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Raw task payload, decoded lazily
    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Build an event from one parsed stream line
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::ProtocolMalformed {
            message: format!("invalid event: {}", e),
        })
    }

    /// Decode the embedded task payload
    pub fn decode_task(&self) -> Result<Task> {
        Task::deserialize(&self.data).map_err(|e| Error::ProtocolMalformed {
            message: format!("invalid task payload in {} event: {}", self.event_type, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskState;
    use serde_json::json;

    #[test]
    fn test_event_from_json() {
        let event = Event::from_json(json!({
            "type": "Created",
            "data": {"id": "t1", "method_path": "math.add", "args": [2, 3], "state": "Created"}
        }))
        .unwrap();

        assert_eq!(event.event_type, EventType::Created);
        let task = event.decode_task().unwrap();
        assert_eq!(task.id, "t1");
        assert_eq!(task.state, TaskState::Created);
    }

    #[test]
    fn test_event_type_aliases_and_unknown() {
        let event = Event::from_json(json!({"type": "UPDATED", "data": {}})).unwrap();
        assert_eq!(event.event_type, EventType::Updated);

        let event = Event::from_json(json!({"type": "Renamed", "data": {}})).unwrap();
        assert_eq!(event.event_type, EventType::Unknown);
        assert!(!event.event_type.is_dispatchable());
    }

    #[test]
    fn test_event_missing_type_is_malformed() {
        let err = Event::from_json(json!({"data": {}})).unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }

    #[test]
    fn test_decode_task_bad_payload() {
        let event = Event::from_json(json!({"type": "Created", "data": {"id": "t1"}})).unwrap();
        let err = event.decode_task().unwrap_err();
        assert!(err.to_string().contains("Created"));
    }
}
