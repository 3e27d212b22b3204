// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # hostctl
//!
//! The `hostctl` binary runs the host controller of one host and talks to a
//! running host controller over its management API.
//!
//! ## Commands
//!
//! - `hostctl run` - Boot the host controller in the foreground
//! - `hostctl server list|status|start|stop|restart|reload` - Managed servers
//! - `hostctl host list|prune` - Slave host registrations (master only)
//! - `hostctl events` - Follow state changes and connection events
//! - `hostctl config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use hostctl_cli::commands::{self, ConfigCommand, HostCommand, ServerCommand};
use hostctl_cli::daemon;
use hostctl_core::domain::host_config::HostConfigManifest;

/// hostctl - supervise the servers of one host in a managed domain
#[derive(Parser)]
#[command(name = "hostctl")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "HOSTCTL_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Management API port
    #[arg(long, global = true, env = "HOSTCTL_API_PORT", default_value = "8090")]
    port: u16,

    /// Management API host
    #[arg(long, global = true, env = "HOSTCTL_API_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "HOSTCTL_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host controller in the foreground
    #[command(name = "run")]
    Run,

    /// Managed server operations
    #[command(name = "server")]
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },

    /// Slave host registrations
    #[command(name = "host")]
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },

    /// Follow server state changes and domain connection events
    #[command(name = "events")]
    Events {
        /// Print raw JSON events
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) => {
            let config = HostConfigManifest::load_or_default(cli.config)
                .context("Failed to load configuration")?;
            let logging = config
                .spec
                .observability
                .as_ref()
                .map(|o| o.logging.clone())
                .unwrap_or_default();
            let level = cli.log_level.unwrap_or(logging.level);
            init_logging(&level, &logging.format)?;
            daemon::run_host_controller(config).await
        }
        Some(Commands::Server { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::server::handle_command(command, &cli.host, cli.port).await
        }
        Some(Commands::Host { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::host::handle_command(command, &cli.host, cli.port).await
        }
        Some(Commands::Events { json }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::events::follow(&cli.host, cli.port, json).await
        }
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
