//! Common test utilities and fixtures
//!
//! A mock control server built on axum: it serves a fixed watch stream
//! that closes after the last line, and an in-memory task store that
//! records every state written to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

/// Shared state of the mock server
#[derive(Default)]
pub struct ServerState {
    tasks: Mutex<HashMap<String, Value>>,
    history: Mutex<Vec<(String, String)>>,
    stream: Vec<String>,
}

/// Handle to a running mock control server
pub struct MockServer {
    pub url: String,
    state: Arc<ServerState>,
}

impl MockServer {
    /// Start a server holding `tasks` whose watch stream sends `lines`
    pub fn start(tasks: Vec<Value>, lines: Vec<String>) -> Self {
        let tasks = tasks
            .into_iter()
            .map(|t| (t["id"].as_str().unwrap().to_string(), t))
            .collect();
        let state = Arc::new(ServerState {
            tasks: Mutex::new(tasks),
            history: Mutex::new(Vec::new()),
            stream: lines,
        });

        let app = Router::new()
            .route("/v1/tasks", get(watch))
            .route("/v1/tasks/:id", get(get_task).put(put_task))
            .with_state(Arc::clone(&state));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });

        Self { url, state }
    }

    /// States written for `task_id`, in order
    pub fn states(&self, task_id: &str) -> Vec<String> {
        self.state
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    /// Current server copy of a task
    pub fn task(&self, task_id: &str) -> Option<Value> {
        self.state.tasks.lock().unwrap().get(task_id).cloned()
    }

    /// Write an agent config pointing at this server
    pub fn write_config(&self, dir: &Path, extra: &str) -> PathBuf {
        let path = dir.join("agent.toml");
        let content = format!(
            r#"
[agent]
server_url = "{}"
log_dir = "{}"

[pool]
workers = 4

[logging]
level = "debug"
{}
"#,
            self.url,
            dir.join("logs").display(),
            extra
        );
        std::fs::write(&path, content).unwrap();
        path
    }
}

/// A task resource as the server stores it
pub fn task(id: &str, method_path: &str, args: Value) -> Value {
    json!({
        "id": id,
        "method_path": method_path,
        "args": args,
        "state": "Created",
        "owner": "integration-tests"
    })
}

/// One watch stream line
pub fn event(event_type: &str, data: &Value) -> String {
    json!({"type": event_type, "data": data}).to_string()
}

/// Contents of a task's log file
pub fn task_log(dir: &Path, task_id: &str) -> String {
    std::fs::read_to_string(dir.join("logs").join("tasks").join(format!("{}.log", task_id)))
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────

async fn watch(State(state): State<Arc<ServerState>>) -> Response {
    let lines: Vec<Result<String, Infallible>> =
        state.stream.iter().map(|line| Ok(format!("{}\n", line))).collect();
    Body::from_stream(futures_util::stream::iter(lines)).into_response()
}

async fn get_task(State(state): State<Arc<ServerState>>, UrlPath(id): UrlPath<String>) -> Response {
    match state.tasks.lock().unwrap().get(&id) {
        Some(task) => Json(task.clone()).into_response(),
        None => not_found(),
    }
}

async fn put_task(
    State(state): State<Arc<ServerState>>,
    UrlPath(id): UrlPath<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut tasks = state.tasks.lock().unwrap();
    if !tasks.contains_key(&id) {
        return not_found();
    }

    let new_state = body["state"].as_str().unwrap_or_default().to_string();
    state.history.lock().unwrap().push((id.clone(), new_state));
    tasks.insert(id, body.clone());
    Json(body).into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"code": 404, "message": "task not found"})),
    )
        .into_response()
}
