// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Server Endpoint - management back-channel listener for managed servers
//
// A started server connects here and sends a handshake naming its process
// and presenting the auth key it was given on stdin. Once authenticated the
// connection becomes the server's ServerChannel: the host controller pushes
// management operations down it, the server reports its boot outcome up it.
// Closing the socket from either side resolves the channel's closed() future,
// which the inventory's close handler is waiting on.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::server_inventory::ServerInventory;
use crate::domain::boot::OperationId;
use crate::domain::channel::{ChannelError, ChannelId, ManagementOperation, ServerChannel};
use crate::domain::process::process_server_name;
use crate::infrastructure::framing::{decode_frame, encode_frame, frame_codec};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First frame a server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHandshake {
    pub process_name: String,
    /// `=` followed by the server name
    pub user: String,
    /// Base64 auth key from the boot payload
    pub auth_key: String,
    #[serde(default)]
    pub reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerStarted {
        #[serde(default)]
        operation_id: Option<OperationId>,
    },
    ServerStartFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    HandshakeAccepted { requires_reload: bool },
    HandshakeRejected { reason: String },
    Operation { operation: ManagementOperation },
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("back-channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed back-channel frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("server closed the connection before its handshake")]
    NoHandshake,

    #[error("server did not complete its handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// Outbound half of an authenticated back-channel.
pub struct TcpServerChannel {
    id: ChannelId,
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<HostMessage>,
    closed: CancellationToken,
}

impl fmt::Debug for TcpServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServerChannel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

#[async_trait]
impl ServerChannel for TcpServerChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, operation: ManagementOperation) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed(self.id));
        }
        self.sender
            .send(HostMessage::Operation { operation })
            .map_err(|_| ChannelError::Closed(self.id))
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Accept back-channel connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, inventory: Arc<ServerInventory>, shutdown: CancellationToken) {
    if let Ok(address) = listener.local_addr() {
        info!(address = %address, "Server management endpoint listening");
    }
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept server connection");
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        let inventory = inventory.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, inventory, shutdown).await {
                warn!(peer = %peer, error = %e, "Server connection ended with error");
            }
        });
    }
    debug!("Server management endpoint stopped");
}

/// Run one back-channel connection to completion.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    inventory: Arc<ServerInventory>,
    shutdown: CancellationToken,
) -> Result<(), EndpointError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(stream, frame_codec());

    let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Err(_) => return Err(EndpointError::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
        Ok(None) => return Err(EndpointError::NoHandshake),
        Ok(Some(frame)) => frame?,
    };
    let handshake: ServerHandshake = decode_frame(&frame)?;

    if let Err(reason) = authenticate(&inventory, &handshake) {
        framed
            .send(encode_frame(&HostMessage::HandshakeRejected { reason: reason.clone() })?)
            .await?;
        return Err(EndpointError::Rejected(reason));
    }

    let (mut sink, mut frames) = framed.split();
    let (sender, mut outbound) = mpsc::unbounded_channel::<HostMessage>();
    let closed = shutdown.child_token();
    let channel = Arc::new(TcpServerChannel {
        id: ChannelId::new(),
        peer,
        sender,
        closed: closed.clone(),
    });

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = writer_closed.cancelled() => break,
            };
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode back-channel message");
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        writer_closed.cancel();
        while let Ok(message) = outbound.try_recv() {
            let Ok(frame) = encode_frame(&message) else {
                break;
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let process_name = handshake.process_name.clone();
    let accepted = if handshake.reconnect {
        inventory
            .server_reconnected(&process_name, channel.clone())
            .map(|no_reload| Some(!no_reload))
    } else {
        inventory
            .server_communication_registered(&process_name, channel.clone())
            .map(|registered| registered.then_some(false))
    };
    let reply = match accepted {
        Ok(Some(requires_reload)) => HostMessage::HandshakeAccepted { requires_reload },
        Ok(None) => HostMessage::HandshakeRejected {
            reason: "server is not expecting a management channel".to_string(),
        },
        Err(e) => HostMessage::HandshakeRejected { reason: e.to_string() },
    };
    let rejected = matches!(reply, HostMessage::HandshakeRejected { .. });
    let _ = channel.sender.send(reply);
    if rejected {
        channel.close();
        let _ = writer.await;
        return Err(EndpointError::Rejected(format!("{process_name} not accepted")));
    }
    info!(process_name = %process_name, peer = %peer, channel = %channel.id, "Server management channel open");

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = closed.cancelled() => break,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(process_name = %process_name, error = %e, "Back-channel read failed");
                break;
            }
            None => break,
        };
        match decode_frame::<ServerMessage>(&frame) {
            Ok(ServerMessage::ServerStarted { operation_id }) => {
                inventory.server_started(&process_name, operation_id);
            }
            Ok(ServerMessage::ServerStartFailed) => inventory.server_start_failed(&process_name),
            Err(e) => warn!(process_name = %process_name, error = %e, "Ignoring malformed back-channel frame"),
        }
    }

    channel.close();
    let _ = writer.await;
    debug!(process_name = %process_name, "Server management channel closed");
    Ok(())
}

fn authenticate(inventory: &ServerInventory, handshake: &ServerHandshake) -> Result<(), String> {
    let Some(user_server) = handshake.user.strip_prefix('=') else {
        return Err("malformed user".to_string());
    };
    if user_server != process_server_name(&handshake.process_name) {
        return Err("user does not match process".to_string());
    }
    let key = BASE64
        .decode(&handshake.auth_key)
        .map_err(|_| "malformed auth key".to_string())?;
    if !inventory.authenticate_server(&handshake.user, &key) {
        return Err("authentication failed".to_string());
    }
    Ok(())
}
