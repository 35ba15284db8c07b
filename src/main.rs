// src/main.rs

//! The main entry point for the roleswitch command-line tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use roleswitch::config::{Config, DEFAULT_CONFIG_PATH};
use roleswitch::core::host::Host;
use roleswitch::core::status::StatusReader;
use roleswitch::core::status::watch::SyncWatcher;
use roleswitch::{Coordinator, Direction, RoleSwitchError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Exit status for an unusable configuration (EX_CONFIG-style usage error).
const EXIT_CONFIG: i32 = 64;

/// Safe role transitions for a two-node replicated storage cluster.
#[derive(Parser, Debug)]
#[command(name = "roleswitch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the replicated resource name from the configuration
    #[arg(short, long)]
    resource: Option<String>,

    /// Override the log level (ignored when RUST_LOG is set). Promote and demote
    /// default to "info,roleswitch::core=debug", the other commands to "info"
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Promote this node to Primary and bring up the filesystem and exports
    Promote,

    /// Stop exports, unmount, and demote this node to Secondary
    Demote,

    /// Print one status snapshot of the resource
    Status {
        /// Emit JSON instead of a single text line
        #[arg(long)]
        json: bool,
    },

    /// Follow the resource's synchronization state
    Watch {
        /// Polling interval, e.g. "1s" or "500ms"
        #[arg(long, default_value = "1s", value_parser = parse_duration)]
        interval: Duration,

        /// Exit as soon as both disks are up to date and connected
        #[arg(long)]
        until_synced: bool,

        /// Number of state changes kept for the exit summary
        #[arg(long, default_value_t = 12)]
        max_history: usize,
    },
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load the configuration. The tool cannot act safely without it.
    let mut config = match Config::from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{}\": {e:#}", cli.config);
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(resource) = cli.resource {
        config.resource = resource;
    }
    if let Some(level) = cli.log_level {
        config.log_level = Some(level);
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        std::process::exit(EXIT_CONFIG);
    }

    // Transition commands default to debug output for the core state machines.
    let is_transition = matches!(cli.command, Command::Promote | Command::Demote);
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter(is_transition));

    // Setup logging with compact format and ANSI colors.
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    for note in config.advisories() {
        warn!("{}", note);
    }

    let host = Host::system(&config);
    let code = match cli.command {
        Command::Promote => transition(&config, host, Direction::Promote).await,
        Command::Demote => transition(&config, host, Direction::Demote).await,
        Command::Status { json } => status(&config, host, json).await?,
        Command::Watch {
            interval,
            until_synced,
            max_history,
        } => watch(&config, host, interval, until_synced, max_history).await,
    };
    std::process::exit(code);
}

async fn transition(config: &Config, host: Host, direction: Direction) -> i32 {
    info!(
        "roleswitch {} starting {} of '{}'.",
        env!("CARGO_PKG_VERSION"),
        direction,
        config.resource
    );
    let outcome = Coordinator::new(config, host).run(direction).await;
    if !outcome.is_success() {
        error!("{} of '{}': {}", direction, config.resource, outcome);
    }
    outcome.exit_code()
}

async fn status(config: &Config, host: Host, json: bool) -> Result<i32> {
    let reader = StatusReader::new(host.replication, config.replication.status_timeout);
    match reader.read(&config.resource).await {
        Ok(status) if json => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }
        Ok(status) => {
            println!("{status} phase={}", status.sync_phase());
            Ok(0)
        }
        Err(e @ RoleSwitchError::ResourceNotFound(_)) => {
            eprintln!("{e}");
            Ok(3)
        }
        Err(e) => {
            eprintln!("{e}");
            Ok(1)
        }
    }
}

async fn watch(
    config: &Config,
    host: Host,
    interval: Duration,
    until_synced: bool,
    max_history: usize,
) -> i32 {
    let reader = StatusReader::new(host.replication, config.replication.status_timeout);
    let mut watcher = SyncWatcher::new(reader, &config.resource, max_history);

    let finished = tokio::select! {
        _ = watcher.run(interval, until_synced) => true,
        _ = tokio::signal::ctrl_c() => false,
    };

    println!("State change history for '{}':", config.resource);
    for entry in watcher.history() {
        println!("{entry}");
    }
    if let Some(status) = watcher.last_status() {
        println!("Last status: {status}");
    }

    if finished || !until_synced { 0 } else { 1 }
}
