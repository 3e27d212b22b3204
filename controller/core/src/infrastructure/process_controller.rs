// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Process Controller Client - JSON lines over TCP
//
// Requests are queued on an unbounded channel and written by a dedicated
// task, so callers (state machine transition tasks) never wait on the
// socket. Notifications are decoded by a reader task and dispatched to the
// ProcessMessageHandler one at a time, in arrival order. A handler is bound
// after connecting because the handler (the server inventory) itself needs
// the client.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::domain::auth::AuthKey;
use crate::domain::process::{
    ProcessControllerClient, ProcessControllerError, ProcessInfo, ProcessMessageHandler, ProcessOperationType,
};

const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProcessControllerRequest {
    Add {
        process_name: String,
        auth_key: String,
        command: Vec<String>,
        environment: HashMap<String, String>,
        working_directory: PathBuf,
    },
    Start {
        process_name: String,
    },
    Stop {
        process_name: String,
    },
    Remove {
        process_name: String,
    },
    Destroy {
        process_name: String,
    },
    Kill {
        process_name: String,
    },
    Reconnect {
        process_name: String,
        management_address: String,
        managed_subsystem_endpoint: bool,
        auth_key: String,
    },
    SendStdin {
        process_name: String,
        /// Base64 encoded
        payload: String,
    },
    RequestInventory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessControllerNotification {
    ProcessAdded {
        process_name: String,
    },
    ProcessStarted {
        process_name: String,
    },
    ProcessStopped {
        process_name: String,
        #[serde(default)]
        uptime_millis: u64,
    },
    ProcessRemoved {
        process_name: String,
    },
    ProcessInventory {
        processes: HashMap<String, ProcessInfo>,
    },
    OperationFailed {
        process_name: String,
        operation: ProcessOperationType,
    },
    Shutdown,
}

pub struct TcpProcessControllerClient {
    sender: mpsc::UnboundedSender<ProcessControllerRequest>,
}

/// Read half of a process controller connection, waiting for its handler.
pub struct ProcessControllerNotifications<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl TcpProcessControllerClient {
    pub async fn connect(
        address: &str,
    ) -> Result<(Self, ProcessControllerNotifications<ReadHalf<TcpStream>>), ProcessControllerError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        info!(address = %address, "Connected to process controller");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream<S>(stream: S) -> (Self, ProcessControllerNotifications<ReadHalf<S>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(FramedWrite::new(writer, LinesCodec::new()), receiver));
        let notifications = ProcessControllerNotifications {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        };
        (Self { sender }, notifications)
    }

    fn send(&self, request: ProcessControllerRequest) -> Result<(), ProcessControllerError> {
        self.sender
            .send(request)
            .map_err(|_| ProcessControllerError::ConnectionClosed)
    }
}

impl<R> ProcessControllerNotifications<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    /// Start delivering notifications to `handler`.
    pub fn spawn_dispatcher(self, handler: Arc<dyn ProcessMessageHandler>) -> JoinHandle<()> {
        tokio::spawn(dispatch_notifications(self.lines, handler))
    }
}

impl ProcessControllerClient for TcpProcessControllerClient {
    fn add_process(
        &self,
        process_name: &str,
        auth_key: &AuthKey,
        command: &[String],
        environment: &HashMap<String, String>,
        working_directory: &Path,
    ) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::Add {
            process_name: process_name.to_string(),
            auth_key: auth_key.to_base64(),
            command: command.to_vec(),
            environment: environment.clone(),
            working_directory: working_directory.to_path_buf(),
        })
    }

    fn start_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::Start {
            process_name: process_name.to_string(),
        })
    }

    fn stop_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::Stop {
            process_name: process_name.to_string(),
        })
    }

    fn remove_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::Remove {
            process_name: process_name.to_string(),
        })
    }

    fn destroy_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::Destroy {
            process_name: process_name.to_string(),
        })
    }

    fn kill_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::Kill {
            process_name: process_name.to_string(),
        })
    }

    fn reconnect_process(
        &self,
        process_name: &str,
        management_address: SocketAddr,
        managed_subsystem_endpoint: bool,
        auth_key: &AuthKey,
    ) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::Reconnect {
            process_name: process_name.to_string(),
            management_address: management_address.to_string(),
            managed_subsystem_endpoint,
            auth_key: auth_key.to_base64(),
        })
    }

    fn send_stdin(&self, process_name: &str, payload: Vec<u8>) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::SendStdin {
            process_name: process_name.to_string(),
            payload: BASE64.encode(payload),
        })
    }

    fn request_process_inventory(&self) -> Result<(), ProcessControllerError> {
        self.send(ProcessControllerRequest::RequestInventory)
    }
}

async fn write_requests<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut receiver: mpsc::UnboundedReceiver<ProcessControllerRequest>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = receiver.recv().await {
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to encode process controller request");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            error!(error = %e, "Failed to write to process controller");
            break;
        }
    }
    debug!("Process controller writer finished");
}

async fn dispatch_notifications<R>(mut lines: FramedRead<R, LinesCodec>, handler: Arc<dyn ProcessMessageHandler>)
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                handler.handle_connection_failure(&e.to_string());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProcessControllerNotification>(&line) {
            Ok(notification) => dispatch(handler.as_ref(), notification),
            Err(e) => warn!(error = %e, "Ignoring undecodable process controller notification"),
        }
    }
    handler.handle_connection_finished();
}

fn dispatch(handler: &dyn ProcessMessageHandler, notification: ProcessControllerNotification) {
    match notification {
        ProcessControllerNotification::ProcessAdded { process_name } => handler.handle_process_added(&process_name),
        ProcessControllerNotification::ProcessStarted { process_name } => {
            handler.handle_process_started(&process_name)
        }
        ProcessControllerNotification::ProcessStopped {
            process_name,
            uptime_millis,
        } => handler.handle_process_stopped(&process_name, uptime_millis),
        ProcessControllerNotification::ProcessRemoved { process_name } => {
            handler.handle_process_removed(&process_name)
        }
        ProcessControllerNotification::ProcessInventory { processes } => handler.handle_process_inventory(processes),
        ProcessControllerNotification::OperationFailed {
            process_name,
            operation,
        } => handler.handle_operation_failed(&process_name, operation),
        ProcessControllerNotification::Shutdown => handler.handle_connection_shutdown(),
    }
}
