//! Task state client
//!
//! Reads and writes the `state` field of `/v1/tasks/{id}` on the control
//! server. Updates are read-modify-write: the full resource is fetched, its
//! state replaced, and the whole body written back so fields the agent does
//! not know about survive.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::types::TaskState;

/// Remote store of task state, as seen by the executor
#[async_trait]
pub trait TaskStateStore: Send + Sync {
    /// Fetch the raw task resource
    async fn get(&self, task_id: &str) -> Result<Value>;

    /// Set the task's state, preserving every other field
    async fn update_state(&self, task_id: &str, state: TaskState) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────
// HTTP Client
// ─────────────────────────────────────────────────────────────────

/// reqwest-backed [`TaskStateStore`]
#[derive(Debug, Clone)]
pub struct StateClient {
    client: Client,
    base_url: Url,
}

impl StateClient {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::config_field_invalid("agent.server_url", e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::config_field_invalid(
                "agent.server_url",
                format!("{} cannot be used as a base URL", base_url),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// URL of a single task resource
    ///
    /// The id is one percent-encoded path segment, so `/`, `?` and `#` in
    /// an id cannot address another resource. Dot segments would be
    /// dropped from the path and are rejected.
    pub fn task_url(&self, task_id: &str) -> Result<Url> {
        if matches!(task_id, "" | "." | "..") {
            return Err(Error::remote_state(task_id, "task id is not a valid URL path segment"));
        }

        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["v1", "tasks", task_id]);
        }
        Ok(url)
    }

    async fn read_body(&self, task_id: &str, response: Response) -> Result<Value> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::remote_state(task_id, format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| error_message(&body))
                .unwrap_or(text);
            return Err(Error::remote_state(
                task_id,
                format!("server returned {}: {}", status, message),
            ));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            Error::remote_state(task_id, format!("response is not valid JSON: {}", e))
        })?;
        if let Some(message) = error_message(&body) {
            return Err(Error::remote_state(task_id, message));
        }
        Ok(body)
    }
}

#[async_trait]
impl TaskStateStore for StateClient {
    async fn get(&self, task_id: &str) -> Result<Value> {
        let url = self.task_url(task_id)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::remote_state(task_id, format!("GET {} failed: {}", url, e)))?;

        let body = self.read_body(task_id, response).await?;
        if !body.is_object() {
            return Err(Error::remote_state(task_id, "task resource is not a JSON object"));
        }
        Ok(body)
    }

    async fn update_state(&self, task_id: &str, state: TaskState) -> Result<()> {
        let mut body = self.get(task_id).await?;
        if let Some(fields) = body.as_object_mut() {
            fields.insert("state".to_string(), Value::String(state.as_str().to_string()));
        }

        let url = self.task_url(task_id)?;
        let response = self
            .client
            .put(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::remote_state(task_id, format!("PUT {} failed: {}", url, e)))?;
        self.read_body(task_id, response).await?;

        debug!(task_id, state = %state, "Remote task state updated");
        Ok(())
    }
}

/// Server message of an error-shaped body: `code` and `message` but no `id`
fn error_message(body: &Value) -> Option<String> {
    let fields = body.as_object()?;
    if fields.contains_key("id") || !fields.contains_key("code") {
        return None;
    }
    let message = fields.get("message")?;
    Some(match message {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
