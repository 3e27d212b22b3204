// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Slave host registration commands (master only)

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use crate::daemon::HostctlClient;
use hostctl_core::domain::host_registrations::HostRegistrationSummary;

#[derive(Subcommand)]
pub enum HostCommand {
    /// List slave hosts known to the master
    List {
        /// Print the connection history of each host
        #[arg(long)]
        events: bool,
    },

    /// Drop expired connection history and disconnected hosts
    Prune,
}

pub async fn handle_command(command: HostCommand, host: &str, port: u16) -> Result<()> {
    let client = HostctlClient::new(host, port)?;

    match command {
        HostCommand::List { events } => {
            let hosts = client.list_hosts().await?;
            print_hosts(&hosts, events);
            Ok(())
        }
        HostCommand::Prune => {
            let hosts = client.prune_hosts().await?;
            println!("{}", "✓ Host registrations pruned".green());
            print_hosts(&hosts, false);
            Ok(())
        }
    }
}

fn print_hosts(hosts: &[HostRegistrationSummary], with_events: bool) {
    if hosts.is_empty() {
        println!("{}", "No slave hosts registered".dimmed());
        return;
    }

    for host in hosts {
        let state = if host.connected {
            "connected".green()
        } else {
            "disconnected".dimmed()
        };
        let address = host
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{} {} {}", host.host_name.bold(), state, address);

        if with_events {
            for event in &host.events {
                match &event.message {
                    Some(message) => println!("    {} {:?} {}", event.timestamp, event.event_type, message),
                    None => println!("    {} {:?}", event.timestamp, event.event_type),
                }
            }
        }
    }
}
