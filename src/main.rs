//! Task Agent - remote task dispatcher
//!
//! This is the main entry point for the task-agent binary. `run` watches
//! the control server and executes tasks; the hidden `exec-task` command
//! is what the agent spawns to run a single task in its own process.

use clap::Parser;
use tracing::{info, Level};

use task_agent::callables::CallableRegistry;
use task_agent::cli::{Cli, Commands, ConfigSubcommand};
use task_agent::config::{self, AgentConfig, CliOverrides};
use task_agent::error::{Error, Result};
use task_agent::executor::run_task_process;
use task_agent::{logging, Agent};

fn main() {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // Errors from a task process are already in the task log
    if let Commands::ExecTask { ref task_id, ref method } = cli.command {
        if let Err(e) = exec_task(task_id, method, cli.verbose) {
            std::process::exit(e.exit_code());
        }
        return;
    }

    let result = match cli.command {
        Commands::ExecTask { .. } => unreachable!(),
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Callables => {
            for path in CallableRegistry::with_builtins().method_paths() {
                println!("{}", path);
            }
            Ok(())
        }
        Commands::Config { ref subcommand } => handle_config_command(subcommand.clone()),
        Commands::Run {
            ref config,
            ref server,
            ref log_dir,
            workers,
            isolation,
        } => {
            let overrides = CliOverrides {
                server_url: server.clone(),
                log_dir: log_dir.clone(),
                workers,
                isolation,
            };
            run(config.as_deref(), &overrides, cli.verbose, cli.quiet)
        }
    };

    if let Err(e) = result {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

/// Run the agent until the watch stream is lost or Ctrl+C
fn run(config_path: Option<&str>, overrides: &CliOverrides, verbose: u8, quiet: bool) -> Result<()> {
    let config = AgentConfig::load_with(config_path, overrides)?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, verbose, quiet)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server_url = %config.server_url(),
        "Starting task agent"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("task-agent")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async {
        let agent = Agent::new(config)?;

        tokio::select! {
            result = agent.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                agent.drain().await;
                Ok(())
            }
        }
    })
}

/// Child side of process isolation; stdout and stderr are the task log
fn exec_task(task_id: &str, method_path: &str, verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    logging::init_task_output(level)?;

    let registry = CallableRegistry::with_builtins();
    run_task_process(&registry, task_id, method_path).map_err(|e| {
        eprintln!("error: {}", e.format_for_log());
        e
    })
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    logging::init_simple(Level::WARN)?;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = AgentConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            AgentConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
