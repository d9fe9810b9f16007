//! Event dispatch
//!
//! Turns watch events into executions. A task is dispatched only if it is
//! not already executing here and its payload state is not terminal; the
//! in-flight claim is taken in the same step as that check.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::executor::{InFlightSet, TaskExecutor, WorkerPool};
use crate::types::{Event, EventType, TaskState};

/// What the dispatcher did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Task claimed and submitted to the pool
    Dispatched,
    /// Task is already executing on this agent
    AlreadyInFlight,
    /// Payload reports a terminal state
    AlreadyTerminal(TaskState),
    /// Event type never dispatches
    Ignored(EventType),
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Dispatched => write!(f, "dispatched"),
            DispatchOutcome::AlreadyInFlight => write!(f, "already in flight"),
            DispatchOutcome::AlreadyTerminal(state) => write!(f, "already {}", state),
            DispatchOutcome::Ignored(event_type) => write!(f, "ignored {} event", event_type),
        }
    }
}

/// Consumer of decoded watch events
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Result<DispatchOutcome>;
}

// ─────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────

/// Deduplicating bridge from the watch stream to the worker pool
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inflight: Arc<InFlightSet>,
    pool: WorkerPool,
    executor: Arc<TaskExecutor>,
}

impl Dispatcher {
    pub fn new(inflight: Arc<InFlightSet>, pool: WorkerPool, executor: Arc<TaskExecutor>) -> Self {
        Self {
            inflight,
            pool,
            executor,
        }
    }

    pub fn inflight(&self) -> &Arc<InFlightSet> {
        &self.inflight
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }
}

impl EventHandler for Dispatcher {
    fn handle(&self, event: &Event) -> Result<DispatchOutcome> {
        if !event.event_type.is_dispatchable() {
            debug!(event_type = %event.event_type, "Ignoring event");
            return Ok(DispatchOutcome::Ignored(event.event_type));
        }

        let task = event.decode_task()?;

        if task.state.is_terminal() {
            debug!(task_id = %task.id, state = %task.state, "Task already finished");
            return Ok(DispatchOutcome::AlreadyTerminal(task.state));
        }

        let claim = match self.inflight.try_claim(&task.id) {
            Some(claim) => claim,
            None => {
                debug!(task_id = %task.id, "Task already in flight");
                return Ok(DispatchOutcome::AlreadyInFlight);
            }
        };

        info!(
            task_id = %task.id,
            method_path = %task.method_path,
            event_type = %event.event_type,
            in_flight = self.inflight.len(),
            "Dispatching task"
        );

        let executor = Arc::clone(&self.executor);
        self.pool.submit(async move {
            executor.execute(task, claim).await;
        });

        Ok(DispatchOutcome::Dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callables::CallableRegistry;
    use crate::client::TaskStateStore;
    use crate::error::Error;
    use crate::executor::InProcessRunner;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingStore {
        updates: Mutex<Vec<(String, TaskState)>>,
    }

    impl RecordingStore {
        fn count(&self, task_id: &str, state: TaskState) -> usize {
            self.updates
                .lock()
                .iter()
                .filter(|(id, s)| id == task_id && *s == state)
                .count()
        }
    }

    #[async_trait]
    impl TaskStateStore for RecordingStore {
        async fn get(&self, task_id: &str) -> Result<Value> {
            Ok(json!({"id": task_id}))
        }

        async fn update_state(&self, task_id: &str, state: TaskState) -> Result<()> {
            self.updates.lock().push((task_id.to_string(), state));
            Ok(())
        }
    }

    fn dispatcher(store: Arc<RecordingStore>, dir: &TempDir) -> Dispatcher {
        let registry = Arc::new(CallableRegistry::with_builtins());
        let runner = Arc::new(InProcessRunner::new(Arc::clone(&registry)));
        let executor = Arc::new(TaskExecutor::new(store, registry, runner, dir.path()));
        Dispatcher::new(InFlightSet::new(), WorkerPool::new(4), executor)
    }

    fn event(event_type: &str, data: Value) -> Event {
        Event::from_json(json!({"type": event_type, "data": data})).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_created_runs_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordingStore::default());
        let dispatcher = dispatcher(Arc::clone(&store), &dir);

        let created = event(
            "Created",
            json!({"id": "t1", "method_path": "util.sleep", "args": [0.2], "state": "Created"}),
        );
        assert_eq!(dispatcher.handle(&created).unwrap(), DispatchOutcome::Dispatched);
        assert!(dispatcher.inflight().contains("t1"));
        assert_eq!(dispatcher.handle(&created).unwrap(), DispatchOutcome::AlreadyInFlight);

        let updated = event(
            "Updated",
            json!({"id": "t1", "method_path": "util.sleep", "args": [0.2], "state": "Started"}),
        );
        assert_eq!(dispatcher.handle(&updated).unwrap(), DispatchOutcome::AlreadyInFlight);

        dispatcher.pool().wait_idle().await;
        assert_eq!(store.count("t1", TaskState::Started), 1);
        assert_eq!(store.count("t1", TaskState::Completed), 1);
        assert!(dispatcher.inflight().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_payloads_not_dispatched() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordingStore::default());
        let dispatcher = dispatcher(Arc::clone(&store), &dir);

        for state in ["Completed", "Failed"] {
            let done = event(
                "Updated",
                json!({"id": "t2", "method_path": "math.add", "args": [], "state": state}),
            );
            assert!(matches!(
                dispatcher.handle(&done).unwrap(),
                DispatchOutcome::AlreadyTerminal(_)
            ));
        }

        assert!(dispatcher.inflight().is_empty());
        assert_eq!(dispatcher.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_deleted_and_unknown_ignored() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(Arc::new(RecordingStore::default()), &dir);

        let deleted = event("Deleted", json!({"id": "t3", "method_path": "math.add"}));
        assert_eq!(
            dispatcher.handle(&deleted).unwrap(),
            DispatchOutcome::Ignored(EventType::Deleted)
        );

        // Payload is not decoded for ignored types
        let odd = event("Archived", json!("not a task"));
        assert_eq!(
            dispatcher.handle(&odd).unwrap(),
            DispatchOutcome::Ignored(EventType::Unknown)
        );
    }

    #[tokio::test]
    async fn test_bad_payload_is_error() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(Arc::new(RecordingStore::default()), &dir);

        let bad = event("Created", json!({"method_path": "math.add"}));
        let err = dispatcher.handle(&bad).unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
        assert!(dispatcher.inflight().is_empty());
    }

    #[tokio::test]
    async fn test_redispatch_after_completion() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordingStore::default());
        let dispatcher = dispatcher(Arc::clone(&store), &dir);

        let created = event(
            "Created",
            json!({"id": "t4", "method_path": "math.add", "args": [1, 1]}),
        );
        assert_eq!(dispatcher.handle(&created).unwrap(), DispatchOutcome::Dispatched);
        dispatcher.pool().wait_idle().await;

        // A stale non-terminal payload after completion runs again
        assert_eq!(dispatcher.handle(&created).unwrap(), DispatchOutcome::Dispatched);
        dispatcher.pool().wait_idle().await;
        assert_eq!(store.count("t4", TaskState::Completed), 2);
    }
}
