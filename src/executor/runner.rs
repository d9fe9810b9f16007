//! Task execution runner
//!
//! Drives one task through `Started -> {Completed | Failed}`: reports each
//! transition to the control server, runs the callable through a
//! [`TaskRunner`], and releases the task's in-flight claim when done.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::callables::CallableRegistry;
use crate::client::TaskStateStore;
use crate::error::{Error, Result};
use crate::types::{log_file_name, Task, TaskState};

use super::{InFlightGuard, TaskRunner};

// ─────────────────────────────────────────────────────────────────
// Task Executor
// ─────────────────────────────────────────────────────────────────

/// Runs tasks and reports their lifecycle
pub struct TaskExecutor {
    store: Arc<dyn TaskStateStore>,
    registry: Arc<CallableRegistry>,
    runner: Arc<dyn TaskRunner>,
    log_dir: PathBuf,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl TaskExecutor {
    /// Create an executor writing task logs under `log_dir`
    pub fn new(
        store: Arc<dyn TaskStateStore>,
        registry: Arc<CallableRegistry>,
        runner: Arc<dyn TaskRunner>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            runner,
            log_dir: log_dir.into(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Execute `task`, holding `claim` until every report has been attempted
    ///
    /// Never fails: errors become a `Failed` report and are logged.
    pub async fn execute(&self, task: Task, claim: InFlightGuard) -> TaskState {
        let _claim = claim;
        let started = Instant::now();

        info!(
            task_id = %task.id,
            method_path = %task.method_path,
            runner = self.runner.name(),
            "Starting task execution"
        );

        if let Err(e) = self.store.update_state(&task.id, TaskState::Started).await {
            warn!(task_id = %task.id, error = %e, "Failed to report Started state, executing anyway");
        }

        let outcome = match self.run(&task).await {
            Ok(()) => self.store.update_state(&task.id, TaskState::Completed).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    task_id = %task.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Task completed"
                );
                TaskState::Completed
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(task_id = %task.id, error = %e, "Task execution failed");

                if let Err(report) = self.store.update_state(&task.id, TaskState::Failed).await {
                    error!(task_id = %task.id, error = %report, "Failed to report Failed state");
                }
                TaskState::Failed
            }
        }
    }

    async fn run(&self, task: &Task) -> Result<()> {
        // Unknown or malformed paths fail before anything is spawned
        self.registry.resolve(&task.method_path)?;

        let log = self.open_log(task)?;
        self.runner.run(task, log).await
    }

    /// Open the task's log for appending and write the header line
    fn open_log(&self, task: &Task) -> Result<File> {
        std::fs::create_dir_all(&self.log_dir).map_err(|e| Error::IoWrite {
            path: self.log_dir.clone(),
            source: e,
        })?;

        let path = self.log_path(&task.id)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::IoWrite {
                path: path.clone(),
                source: e,
            })?;

        writeln!(
            file,
            "=== {} {} {} ===",
            chrono::Utc::now().to_rfc3339(),
            task.id,
            task.method_path
        )
        .map_err(|e| Error::IoWrite { path, source: e })?;

        Ok(file)
    }

    /// Path of the log file for `task_id`
    pub fn log_path(&self, task_id: &str) -> Result<PathBuf> {
        Ok(self.log_dir.join(log_file_name(task_id)?))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Tasks that reached `Completed`
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Tasks that ended `Failed`
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("runner", &self.runner.name())
            .field("log_dir", &self.log_dir)
            .finish()
    }
}
