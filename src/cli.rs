//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the task agent.

use clap::{Parser, Subcommand};

use crate::config::Isolation;

/// Task Agent - remote task dispatcher
///
/// Watches the control server's task queue, executes every new task in an
/// isolated process, and reports each state transition back to the server.
#[derive(Parser, Debug)]
#[command(name = "task-agent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the agent
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the control server and execute tasks
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "TASK_AGENT_CONFIG")]
        config: Option<String>,

        /// Control server base URL
        #[arg(long)]
        server: Option<String>,

        /// Directory for agent and task logs
        #[arg(long)]
        log_dir: Option<String>,

        /// Maximum concurrently executing tasks (0 = number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,

        /// How each task's callable is isolated
        #[arg(long, value_enum)]
        isolation: Option<Isolation>,
    },

    /// Run one callable with JSON arguments from stdin (used for task processes)
    #[command(hide = true)]
    ExecTask {
        /// Task id, for log context
        #[arg(long)]
        task_id: String,

        /// Dotted method path of the callable
        #[arg(long)]
        method: String,
    },

    /// List the method paths this agent can execute
    Callables,

    /// Display version information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
