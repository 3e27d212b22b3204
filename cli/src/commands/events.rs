// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Follow the host controller event stream

use anyhow::{Context, Result};
use colored::Colorize;
use futures::StreamExt;

use crate::daemon::client::SseDecoder;
use crate::daemon::HostctlClient;
use hostctl_core::domain::events::{DomainConnectionEvent, ServerLifecycleEvent};
use hostctl_core::infrastructure::event_bus::HostEvent;

pub async fn follow(host: &str, port: u16, json: bool) -> Result<()> {
    let client = HostctlClient::new(host, port)?;
    let response = client.events().await?;
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Event stream interrupted")?;
        for event in decoder.push(&chunk) {
            if json {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                println!("{}", describe(&event));
            }
        }
    }

    println!("{}", "Event stream closed".dimmed());
    Ok(())
}

fn describe(event: &HostEvent) -> String {
    match event {
        HostEvent::ServerLifecycle(ServerLifecycleEvent::StateChanged {
            server_name,
            required,
            internal,
            status,
            changed_at,
        }) => format!(
            "{} {} {} (internal {}, required {})",
            changed_at.format("%H:%M:%S%.3f").to_string().dimmed(),
            server_name.bold(),
            status,
            internal,
            required
        ),
        HostEvent::ServerLifecycle(ServerLifecycleEvent::ServerRegistered {
            server_name,
            registered_at,
        }) => format!(
            "{} {} back-channel {}",
            registered_at.format("%H:%M:%S%.3f").to_string().dimmed(),
            server_name.bold(),
            "registered".green()
        ),
        HostEvent::ServerLifecycle(ServerLifecycleEvent::ServerUnregistered {
            server_name,
            unregistered_at,
        }) => format!(
            "{} {} back-channel {}",
            unregistered_at.format("%H:%M:%S%.3f").to_string().dimmed(),
            server_name.bold(),
            "closed".yellow()
        ),
        HostEvent::DomainConnection(DomainConnectionEvent::RegisteredWithMaster {
            host_name,
            master_address,
            registered_at,
        }) => format!(
            "{} {} registered with master {}",
            registered_at.format("%H:%M:%S%.3f").to_string().dimmed(),
            host_name.bold(),
            master_address
        ),
        HostEvent::DomainConnection(DomainConnectionEvent::MasterConnectionLost { master_address, lost_at }) => {
            format!(
                "{} {} {}",
                lost_at.format("%H:%M:%S%.3f").to_string().dimmed(),
                "lost connection to master".red(),
                master_address
            )
        }
        HostEvent::DomainConnection(DomainConnectionEvent::SlaveRegistered {
            host_name,
            registered_at,
        }) => format!(
            "{} slave {} {}",
            registered_at.format("%H:%M:%S%.3f").to_string().dimmed(),
            host_name.bold(),
            "registered".green()
        ),
        HostEvent::DomainConnection(DomainConnectionEvent::SlaveUnregistered {
            host_name,
            reason,
            unregistered_at,
        }) => format!(
            "{} slave {} {} ({})",
            unregistered_at.format("%H:%M:%S%.3f").to_string().dimmed(),
            host_name.bold(),
            "unregistered".yellow(),
            reason
        ),
    }
}
