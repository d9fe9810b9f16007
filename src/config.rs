//! Configuration system for the task agent
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (TASK_AGENT_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control server and local paths
    pub agent: AgentSettings,

    /// Worker pool sizing
    pub pool: PoolSettings,

    /// Task execution settings
    pub executor: ExecutorSettings,

    /// Watch stream settings
    pub watch: WatchSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Control server and path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Base URL of the control server
    pub server_url: String,

    /// Directory holding agent logs; task logs go to `{log_dir}/tasks`
    pub log_dir: String,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of concurrent task executions (0 = number of CPUs)
    pub workers: usize,
}

/// How a task's callable is isolated from the agent and other tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// One child process per task, stdout/stderr redirected to the task log
    Process,
    /// Blocking thread in the agent process, log file injected as the writer
    InProcess,
}

impl Isolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Isolation::Process => "process",
            Isolation::InProcess => "in-process",
        }
    }
}

impl std::str::FromStr for Isolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Isolation::Process),
            "in-process" => Ok(Isolation::InProcess),
            _ => Err(Error::config_field_invalid(
                "executor.isolation",
                format!("Invalid isolation mode '{}'. Must be one of: process, in-process", s),
            )),
        }
    }
}

/// Task execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Isolation mode for running callables
    pub isolation: Isolation,

    /// Timeout for task state requests to the control server
    pub request_timeout_secs: u64,
}

/// Watch stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Re-open the watch stream after the connection drops
    pub reconnect: bool,

    /// Initial reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,

    /// Maximum reconnect delay in milliseconds
    pub reconnect_max_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Agent log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            log_dir: "~/.task-agent/logs".to_string(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { workers: 0 }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            isolation: Isolation::Process,
            request_timeout_secs: 30,
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            reconnect: false,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 60000,
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

/// Values given on the command line, applied after env overrides
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub server_url: Option<String>,
    pub log_dir: Option<String>,
    pub workers: Option<usize>,
    pub isolation: Option<Isolation>,
}

impl AgentConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_with(config_path, &CliOverrides::default())
    }

    /// Load configuration and apply CLI overrides on top
    pub fn load_with(config_path: Option<&str>, overrides: &CliOverrides) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides()?;
        config.apply_cli_overrides(overrides);
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("task-agent.toml"),
            dirs::config_dir()
                .map(|p| p.join("task-agent").join("agent.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".task-agent").join("agent.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/task-agent/agent.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("TASK_AGENT_SERVER_URL") {
            self.agent.server_url = val;
        }
        if let Ok(val) = std::env::var("TASK_AGENT_LOG_DIR") {
            self.agent.log_dir = val;
        }

        if let Ok(val) = std::env::var("TASK_AGENT_WORKERS") {
            if let Ok(n) = val.parse() {
                self.pool.workers = n;
            }
        }

        if let Ok(val) = std::env::var("TASK_AGENT_ISOLATION") {
            self.executor.isolation = val.parse()?;
        }
        if let Ok(val) = std::env::var("TASK_AGENT_REQUEST_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                self.executor.request_timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("TASK_AGENT_RECONNECT") {
            self.watch.reconnect = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = std::env::var("TASK_AGENT_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.watch.max_reconnect_attempts = n;
            }
        }

        if let Ok(val) = std::env::var("TASK_AGENT_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("TASK_AGENT_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("TASK_AGENT_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }

        Ok(())
    }

    /// Apply command line overrides
    fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(ref url) = overrides.server_url {
            self.agent.server_url = url.clone();
        }
        if let Some(ref dir) = overrides.log_dir {
            self.agent.log_dir = dir.clone();
        }
        if let Some(workers) = overrides.workers {
            self.pool.workers = workers;
        }
        if let Some(isolation) = overrides.isolation {
            self.executor.isolation = isolation;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.agent.log_dir = expand_path(&self.agent.log_dir);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.agent.server_url).map_err(|e| {
            Error::config_field_invalid(
                "agent.server_url",
                format!("Invalid server URL '{}': {}", self.agent.server_url, e),
            )
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::config_field_invalid(
                "agent.server_url",
                "Server URL must start with http:// or https://",
            ));
        }

        if self.agent.log_dir.is_empty() {
            return Err(Error::config_field_invalid(
                "agent.log_dir",
                "Log directory cannot be empty",
            ));
        }

        if self.executor.request_timeout_secs == 0 {
            return Err(Error::config_field_invalid(
                "executor.request_timeout_secs",
                "request_timeout_secs must be positive",
            ));
        }

        if self.watch.reconnect_initial_ms == 0
            || self.watch.reconnect_initial_ms > self.watch.reconnect_max_ms
        {
            return Err(Error::config_field_invalid(
                "watch.reconnect_initial_ms",
                "reconnect_initial_ms must be positive and not exceed reconnect_max_ms",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Server base URL without a trailing slash
    pub fn server_url(&self) -> &str {
        self.agent.server_url.trim_end_matches('/')
    }

    /// Directory receiving per-task log files
    pub fn task_log_dir(&self) -> PathBuf {
        PathBuf::from(&self.agent.log_dir).join("tasks")
    }

    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        if self.pool.workers > 0 {
            self.pool.workers
        } else {
            num_cpus::get().max(1)
        }
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".task-agent")
                .join("agent.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Task Agent Configuration

[agent]
# Base URL of the control server
server_url = "http://127.0.0.1:8080"

# Log directory; task output goes to <log_dir>/tasks/<task_id>.log
log_dir = "~/.task-agent/logs"

[pool]
# Concurrent task executions (0 = number of CPUs)
workers = 0

[executor]
# "process" runs every task in its own child process,
# "in-process" runs callables on agent threads with the log file injected
isolation = "process"

# Timeout for task state requests in seconds
request_timeout_secs = 30

[watch]
# Re-open the watch stream when the connection drops
reconnect = false

# Reconnect backoff bounds in milliseconds
reconnect_initial_ms = 1000
reconnect_max_ms = 60000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Agent log file path (comment out to disable file logging)
# file = "~/.task-agent/logs/agent.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
