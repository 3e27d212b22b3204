// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Managed server commands
//!
//! Commands: list, status, start, stop, restart, reload

use anyhow::Result;
use clap::Subcommand;
use colored::{ColoredString, Colorize};

use crate::daemon::HostctlClient;
use hostctl_core::domain::server_state::ServerStatus;

#[derive(Subcommand)]
pub enum ServerCommand {
    /// List the servers of this host
    List,

    /// Show one server
    Status {
        /// Server name
        name: String,
    },

    /// Start a server
    Start {
        /// Server name
        name: String,
    },

    /// Stop a server
    Stop {
        /// Server name
        name: String,

        /// Graceful shutdown timeout in milliseconds
        #[arg(long, value_name = "MS")]
        graceful_timeout: Option<u64>,
    },

    /// Stop a server and start it again
    Restart {
        /// Server name
        name: String,

        /// Graceful shutdown timeout in milliseconds
        #[arg(long, value_name = "MS")]
        graceful_timeout: Option<u64>,
    },

    /// Reload a started server in place
    Reload {
        /// Server name
        name: String,

        /// Permit handed to the reloaded server
        #[arg(long, default_value = "0")]
        permit: u32,
    },
}

pub async fn handle_command(command: ServerCommand, host: &str, port: u16) -> Result<()> {
    let client = HostctlClient::new(host, port)?;

    match command {
        ServerCommand::List => list(&client).await,
        ServerCommand::Status { name } => status(&client, &name).await,
        ServerCommand::Start { name } => {
            let response = client.start_server(&name).await?;
            println!("{} {}", response.server_name.bold(), paint(response.status));
            Ok(())
        }
        ServerCommand::Stop {
            name,
            graceful_timeout,
        } => {
            let response = client.stop_server(&name, graceful_timeout).await?;
            println!("{} {}", response.server_name.bold(), paint(response.status));
            Ok(())
        }
        ServerCommand::Restart {
            name,
            graceful_timeout,
        } => {
            let response = client.restart_server(&name, graceful_timeout).await?;
            println!("{} {}", response.server_name.bold(), paint(response.status));
            Ok(())
        }
        ServerCommand::Reload { name, permit } => {
            client.reload_server(&name, permit).await?;
            println!("{} {}", name.bold(), "reloading".cyan());
            Ok(())
        }
    }
}

async fn list(client: &HostctlClient) -> Result<()> {
    let servers = client.list_servers().await?;
    if servers.is_empty() {
        println!("{}", "No servers configured for this host".dimmed());
        return Ok(());
    }

    println!("{:<24} {:<10} {:<18} {}", "NAME".bold(), "STATUS".bold(), "STATE".bold(), "RELOAD".bold());
    for server in servers {
        println!(
            "{:<24} {:<10} {:<18} {}",
            server.server_name,
            paint(server.status),
            server.internal.to_string(),
            if server.requires_reload { "required".yellow() } else { "-".dimmed() }
        );
    }
    Ok(())
}

async fn status(client: &HostctlClient, name: &str) -> Result<()> {
    let server = client.get_server(name).await?;
    println!("{}", server.server_name.bold());
    println!("  Status:   {}", paint(server.status));
    println!("  Required: {}", server.required);
    println!("  Internal: {}", server.internal);
    if server.requires_reload {
        println!("  {}", "Reload required".yellow());
    }
    Ok(())
}

fn paint(status: ServerStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ServerStatus::Started => text.green(),
        ServerStatus::Starting | ServerStatus::Stopping => text.yellow(),
        ServerStatus::Failed => text.red(),
        ServerStatus::Stopped | ServerStatus::Disabled => text.dimmed(),
    }
}
