//! Agent assembly and the watch loop
//!
//! Wires the state client, callable registry, executor, worker pool and
//! dispatcher together from an [`AgentConfig`], then keeps a watch session
//! open. When `watch.reconnect` is set, lost sessions are re-opened with
//! exponential backoff; otherwise the first loss ends the run.

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tracing::{error, info, warn};

use crate::callables::CallableRegistry;
use crate::client::{StateClient, TaskStateStore, TaskWatcher};
use crate::config::{AgentConfig, Isolation};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::executor::{InFlightSet, InProcessRunner, ProcessRunner, TaskExecutor, TaskRunner, WorkerPool};

/// Bound on opening the watch connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully assembled task agent
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    watcher: TaskWatcher,
    dispatcher: Dispatcher,
}

impl Agent {
    /// Build an agent with the built-in callables and the configured isolation
    pub fn new(config: AgentConfig) -> Result<Self> {
        let registry = Arc::new(CallableRegistry::with_builtins());
        let runner: Arc<dyn TaskRunner> = match config.executor.isolation {
            Isolation::Process => Arc::new(ProcessRunner::current_exe()?),
            Isolation::InProcess => Arc::new(InProcessRunner::new(Arc::clone(&registry))),
        };
        let timeout = Duration::from_secs(config.executor.request_timeout_secs);
        let store: Arc<dyn TaskStateStore> = Arc::new(StateClient::new(config.server_url(), timeout)?);

        Self::with_parts(config, registry, runner, store)
    }

    /// Build an agent from explicit components
    pub fn with_parts(
        config: AgentConfig,
        registry: Arc<CallableRegistry>,
        runner: Arc<dyn TaskRunner>,
        store: Arc<dyn TaskStateStore>,
    ) -> Result<Self> {
        let log_dir = config.task_log_dir();
        std::fs::create_dir_all(&log_dir).map_err(|e| Error::IoWrite {
            path: log_dir.clone(),
            source: e,
        })?;

        let executor = Arc::new(TaskExecutor::new(store, registry, runner, log_dir));
        let pool = WorkerPool::new(config.worker_count());
        let dispatcher = Dispatcher::new(InFlightSet::new(), pool, executor);
        let watcher = TaskWatcher::new(config.server_url(), CONNECT_TIMEOUT)?;

        info!(
            server_url = %config.server_url(),
            workers = dispatcher.pool().size(),
            isolation = config.executor.isolation.as_str(),
            log_dir = %dispatcher.executor().log_dir().display(),
            "Agent assembled"
        );

        Ok(Self {
            config,
            watcher,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Watch until the connection is lost for good
    ///
    /// In-flight tasks are drained before the final error is returned.
    pub async fn run(&self) -> Result<()> {
        let watch = &self.config.watch;
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(watch.reconnect_initial_ms),
            max_interval: Duration::from_millis(watch.reconnect_max_ms),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts: u32 = 0;

        loop {
            let err = match self.watcher.watch(&self.dispatcher).await {
                Ok(()) => Error::ConnectionLost {
                    message: "watch session ended".to_string(),
                },
                Err(e) => e,
            };

            error!(
                error = %err.format_for_log(),
                in_flight = self.dispatcher.inflight().len(),
                "Watch session ended"
            );

            if !watch.reconnect || !err.is_retryable() {
                self.drain().await;
                return Err(err);
            }

            // The stream was open, so start the delays over
            if matches!(err, Error::ConnectionLost { .. }) {
                backoff.reset();
                attempts = 0;
            }

            attempts += 1;
            if watch.max_reconnect_attempts > 0 && attempts > watch.max_reconnect_attempts {
                error!(
                    attempts = attempts - 1,
                    max = watch.max_reconnect_attempts,
                    "Max reconnection attempts reached"
                );
                self.drain().await;
                return Err(err);
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_millis(watch.reconnect_max_ms));
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempts,
                "Reconnecting to control server"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for every dispatched task to finish
    pub async fn drain(&self) {
        let outstanding = self.dispatcher.pool().outstanding();
        if outstanding > 0 {
            warn!(
                outstanding,
                in_flight = ?self.dispatcher.inflight().ids(),
                "Waiting for in-flight tasks to finish"
            );
        }
        self.dispatcher.pool().wait_idle().await;
        info!(
            completed = self.dispatcher.executor().completed_count(),
            failed = self.dispatcher.executor().failed_count(),
            "All tasks finished"
        );
    }
}
