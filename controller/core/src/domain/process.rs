// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process controller contract
//!
//! The process controller is a separate watchdog process that forks and kills
//! OS processes on the host controller's behalf. Requests are fire-and-forget;
//! outcomes arrive later through [`ProcessMessageHandler`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::domain::auth::AuthKey;

/// Prefix that namespaces managed servers among process controller processes.
pub const SERVER_PROCESS_PREFIX: &str = "Server:";

pub fn server_process_name(server_name: &str) -> String {
    format!("{SERVER_PROCESS_PREFIX}{server_name}")
}

pub fn is_server_process(process_name: &str) -> bool {
    process_name.starts_with(SERVER_PROCESS_PREFIX)
}

/// Server name for a process name, or the process name itself when it is not
/// a server process.
pub fn process_server_name(process_name: &str) -> &str {
    process_name
        .strip_prefix(SERVER_PROCESS_PREFIX)
        .unwrap_or(process_name)
}

/// Process controller operation kinds, as reported by `operation_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOperationType {
    Add,
    Start,
    Stop,
    Remove,
    SendStdin,
    Reconnect,
}

impl fmt::Display for ProcessOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessOperationType::Add => "add",
            ProcessOperationType::Start => "start",
            ProcessOperationType::Stop => "stop",
            ProcessOperationType::Remove => "remove",
            ProcessOperationType::SendStdin => "send_stdin",
            ProcessOperationType::Reconnect => "reconnect",
        };
        f.write_str(s)
    }
}

/// One entry of the process controller's inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_name: String,
    /// Base64 auth key the process was added with
    pub auth_key: String,
    pub running: bool,
    pub stopping: bool,
}

#[derive(Debug, Error)]
pub enum ProcessControllerError {
    #[error("process controller connection closed")]
    ConnectionClosed,

    #[error("failed to encode process controller request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("process controller I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process controller rejected request: {0}")]
    Rejected(String),
}

/// Outbound half of the process controller connection.
///
/// Implementations only enqueue the request; they never wait for the
/// matching notification.
pub trait ProcessControllerClient: Send + Sync {
    fn add_process(
        &self,
        process_name: &str,
        auth_key: &AuthKey,
        command: &[String],
        environment: &HashMap<String, String>,
        working_directory: &Path,
    ) -> Result<(), ProcessControllerError>;

    fn start_process(&self, process_name: &str) -> Result<(), ProcessControllerError>;

    fn stop_process(&self, process_name: &str) -> Result<(), ProcessControllerError>;

    fn remove_process(&self, process_name: &str) -> Result<(), ProcessControllerError>;

    fn destroy_process(&self, process_name: &str) -> Result<(), ProcessControllerError>;

    fn kill_process(&self, process_name: &str) -> Result<(), ProcessControllerError>;

    fn reconnect_process(
        &self,
        process_name: &str,
        management_address: SocketAddr,
        managed_subsystem_endpoint: bool,
        auth_key: &AuthKey,
    ) -> Result<(), ProcessControllerError>;

    fn send_stdin(&self, process_name: &str, payload: Vec<u8>) -> Result<(), ProcessControllerError>;

    fn request_process_inventory(&self) -> Result<(), ProcessControllerError>;
}

/// Inbound notifications from the process controller.
///
/// Handlers run on the connection's dispatch task and must not block.
pub trait ProcessMessageHandler: Send + Sync {
    fn handle_process_added(&self, process_name: &str);

    fn handle_process_started(&self, process_name: &str);

    fn handle_process_stopped(&self, process_name: &str, uptime_millis: u64);

    fn handle_process_removed(&self, process_name: &str);

    fn handle_process_inventory(&self, processes: HashMap<String, ProcessInfo>);

    fn handle_operation_failed(&self, process_name: &str, operation: ProcessOperationType);

    fn handle_connection_shutdown(&self);

    fn handle_connection_failure(&self, error: &str);

    fn handle_connection_finished(&self);
}
