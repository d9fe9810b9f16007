//! Isolated callable execution
//!
//! Capturing a task's output by redirecting standard streams only works if
//! nothing else shares them, so the default runner gives every task its own
//! child process: the agent binary re-executes itself in `exec-task` mode
//! with stdout and stderr pointed at the task log and the arguments on
//! stdin. The in-process runner hands the log file to the callable as its
//! writer instead.

use std::fs::File;
use std::io::{LineWriter, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::callables::CallableRegistry;
use crate::error::{Error, Result};
use crate::types::Task;

/// Subcommand the agent binary exposes for task child processes
pub const EXEC_TASK_SUBCOMMAND: &str = "exec-task";

/// Runs a task's callable with its output going to `log`
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run to completion; `Err` means the task failed
    async fn run(&self, task: &Task, log: File) -> Result<()>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────
// Process Runner
// ─────────────────────────────────────────────────────────────────

/// One child process per task
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
}

impl ProcessRunner {
    /// Use `program` (an agent binary) for task processes
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Use the currently running agent binary
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Internal(format!("Cannot locate agent binary: {}", e)))?;
        Ok(Self::new(program))
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    async fn run(&self, task: &Task, log: File) -> Result<()> {
        let stderr = log.try_clone()?;

        let mut child = Command::new(&self.program)
            .arg(EXEC_TASK_SUBCOMMAND)
            .arg("--task-id")
            .arg(&task.id)
            .arg("--method")
            .arg(&task.method_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::execution_failed(
                    &task.id,
                    format!("failed to spawn {}: {}", self.program.display(), e),
                )
            })?;

        debug!(task_id = %task.id, pid = ?child.id(), "Task process spawned");

        let payload = serde_json::to_vec(&task.args)?;
        if let Some(mut stdin) = child.stdin.take() {
            // The exit status is authoritative; a child that exits early closes the pipe
            if let Err(e) = stdin.write_all(&payload).await {
                warn!(task_id = %task.id, error = %e, "Failed to pass arguments to task process");
            }
            drop(stdin);
        }

        let status = child.wait().await.map_err(|e| {
            Error::execution_failed(&task.id, format!("failed to wait for task process: {}", e))
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::execution_failed(
                &task.id,
                format!("task process exited with {}", status),
            ))
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

// ─────────────────────────────────────────────────────────────────
// In-Process Runner
// ─────────────────────────────────────────────────────────────────

/// Runs callables on the blocking thread pool with the log file injected
#[derive(Debug, Clone)]
pub struct InProcessRunner {
    registry: Arc<CallableRegistry>,
}

impl InProcessRunner {
    pub fn new(registry: Arc<CallableRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TaskRunner for InProcessRunner {
    async fn run(&self, task: &Task, log: File) -> Result<()> {
        let callable = self.registry.resolve(&task.method_path)?;
        let args = task.args.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let mut writer = LineWriter::new(log);
            let result = callable(&args, &mut writer);
            if let Err(ref e) = result {
                let _ = writeln!(writer, "error: {:#}", e);
            }
            let _ = writer.flush();
            result
        })
        .await;

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::execution_failed(&task.id, format!("{:#}", e))),
            Err(e) => Err(Error::execution_failed(
                &task.id,
                format!("callable panicked: {}", e),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}

// ─────────────────────────────────────────────────────────────────
// Child Side
// ─────────────────────────────────────────────────────────────────

/// Body of the `exec-task` subcommand
///
/// Reads the JSON argument array from stdin and runs the callable with
/// stdout as its writer. Stdout and stderr are the task log; the caller
/// reports a returned error on stderr.
pub fn run_task_process(registry: &CallableRegistry, task_id: &str, method_path: &str) -> Result<()> {
    let callable = registry.resolve(method_path)?;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let args: Vec<Value> = if input.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&input).map_err(|e| Error::ProtocolMalformed {
            message: format!("task arguments must be a JSON array: {}", e),
        })?
    };

    tracing::info!(task_id, method_path, args = args.len(), "Running task");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = callable(&args, &mut out);
    out.flush()?;

    result.map_err(|e| Error::execution_failed(task_id, format!("{:#}", e)))
}
