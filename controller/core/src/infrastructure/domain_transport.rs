// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Domain Transport - TCP carriage of the registration protocol
//
// Slave side: TcpDomainConnector opens one TCP connection per connect()
// and exposes a single request/response channel over it. Requests carry an
// id so a heartbeat ping can be in flight next to another request.
//
// Master side: serve_registrations accepts slave connections and runs one
// RegistrationSession per connection, answering frames in order.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::registration_handler::HostRegistrationHandler;
use crate::domain::host_registrations::HostPinger;
use crate::domain::registration::{
    DomainChannel, DomainConnection, DomainConnector, DomainRequest, DomainResponse, TransportError,
};
use crate::infrastructure::framing::{decode_frame, encode_frame, frame_codec};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: DomainRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: DomainResponse,
}

pub struct TcpDomainConnector {
    connect_timeout: Duration,
}

impl TcpDomainConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDomainConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl DomainConnector for TcpDomainConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn DomainConnection>, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!(address = %address, "Connected to master");
        Ok(Arc::new(FramedDomainConnection::new(stream)))
    }
}

/// One transport connection carrying one request channel.
pub struct FramedDomainConnection {
    channel: Arc<FramedDomainChannel>,
}

impl FramedDomainConnection {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut sink, mut frames) = Framed::new(stream, frame_codec()).split();
        let (sender, mut outbound) = mpsc::unbounded_channel::<Bytes>();
        let closed = CancellationToken::new();
        let channel = Arc::new(FramedDomainChannel {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            sender,
            closed: closed.clone(),
        });

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = outbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = writer_closed.cancelled() => break,
                };
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "Domain connection write failed");
                    break;
                }
            }
            writer_closed.cancel();
            let _ = sink.close().await;
        });

        let reader_channel = channel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = frames.next() => frame,
                    _ = reader_channel.closed.cancelled() => break,
                };
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(error = %e, "Domain connection read failed");
                        break;
                    }
                    None => break,
                };
                match decode_frame::<ResponseFrame>(&frame) {
                    Ok(response) => reader_channel.complete(response),
                    Err(e) => warn!(error = %e, "Ignoring malformed response from master"),
                }
            }
            reader_channel.closed.cancel();
            reader_channel.pending.lock().clear();
        });

        Self { channel }
    }
}

#[async_trait]
impl DomainConnection for FramedDomainConnection {
    async fn open_channel(&self) -> Result<Arc<dyn DomainChannel>, TransportError> {
        if self.channel.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(self.channel.clone())
    }

    async fn closed(&self) {
        self.channel.closed.cancelled().await
    }

    fn close(&self) {
        self.channel.closed.cancel();
    }
}

pub struct FramedDomainChannel {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<DomainResponse>>>,
    sender: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

impl FramedDomainChannel {
    fn complete(&self, frame: ResponseFrame) {
        match self.pending.lock().remove(&frame.id) {
            Some(waiter) => {
                let _ = waiter.send(frame.response);
            }
            None => debug!(id = frame.id, "Response for unknown request"),
        }
    }
}

#[async_trait]
impl DomainChannel for FramedDomainChannel {
    async fn request(&self, request: DomainRequest) -> Result<DomainResponse, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode_frame(&RequestFrame { id, request })
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (waiter, response) = oneshot::channel();
        self.pending.lock().insert(id, waiter);
        if self.sender.send(frame).is_err() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        tokio::select! {
            response = response => response.map_err(|_| TransportError::Closed),
            _ = self.closed.cancelled() => {
                self.pending.lock().remove(&id);
                Err(TransportError::Closed)
            }
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Master-side handle on a registered slave's connection.
pub struct SlaveHostPinger {
    peer: SocketAddr,
    session: CancellationToken,
}

impl SlaveHostPinger {
    pub fn new(peer: SocketAddr, session: CancellationToken) -> Self {
        Self { peer, session }
    }
}

impl fmt::Debug for SlaveHostPinger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveHostPinger").field("peer", &self.peer).finish()
    }
}

impl HostPinger for SlaveHostPinger {
    fn cancel(&self) {
        self.session.cancel();
    }
}

/// Accept slave connections until `shutdown` fires.
pub async fn serve_registrations(listener: TcpListener, handler: HostRegistrationHandler, shutdown: CancellationToken) {
    if let Ok(address) = listener.local_addr() {
        info!(address = %address, "Slave registration listener started");
    }
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept slave connection");
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        let handler = handler.clone();
        let session = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_slave(stream, peer, handler, session).await {
                warn!(peer = %peer, error = %e, "Slave connection ended with error");
            }
        });
    }
    debug!("Slave registration listener stopped");
}

/// Run one slave registration session to completion.
pub async fn handle_slave<S>(
    stream: S,
    peer: SocketAddr,
    handler: HostRegistrationHandler,
    session_token: CancellationToken,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, frame_codec());
    let pinger = Arc::new(SlaveHostPinger::new(peer, session_token.clone()));
    let mut session = handler.session(peer, pinger);

    let result = loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = session_token.cancelled() => break Ok(()),
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(TransportError::Io(e)),
            None => break Ok(()),
        };
        let RequestFrame { id, request } = match decode_frame(&frame) {
            Ok(request) => request,
            Err(e) => break Err(TransportError::Protocol(e.to_string())),
        };

        let response = session.handle(request);
        let reply = encode_frame(&ResponseFrame { id, response }).map_err(|e| TransportError::Protocol(e.to_string()));
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => break Err(e),
        };
        if let Err(e) = framed.send(reply).await {
            break Err(TransportError::Io(e));
        }
        if session.is_closed() {
            break Ok(());
        }
    };

    if !session.is_closed() {
        session.connection_closed();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::domain_controller::LocalDomainController;
    use crate::domain::domain_controller::RunningMode;
    use crate::domain::domain_model::DomainModel;
    use crate::domain::registration::{HostInfo, REGISTRATION_OUTCOME_OK};
    use crate::infrastructure::event_bus::EventBus;

    fn master() -> (HostRegistrationHandler, Arc<LocalDomainController>) {
        let dc = Arc::new(LocalDomainController::new("host-a", true, RunningMode::Normal, EventBus::new(16)));
        dc.set_domain_model(DomainModel::from_yaml_str("server-group: {}\n").unwrap());
        (HostRegistrationHandler::new(dc.clone()), dc)
    }

    #[tokio::test]
    async fn test_registration_over_duplex() {
        let (handler, dc) = master();
        let (slave_end, master_end) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let session = tokio::spawn(handle_slave(master_end, peer, handler, CancellationToken::new()));

        let connection = FramedDomainConnection::new(slave_end);
        let channel = connection.open_channel().await.unwrap();

        let response = channel
            .request(DomainRequest::RegisterHostController {
                host_id: "host-b".into(),
                host_info: HostInfo::local("host-b"),
            })
            .await
            .unwrap();
        assert!(matches!(response, DomainResponse::DomainModel { .. }));

        let ack = channel
            .request(DomainRequest::CompleteRegistration {
                outcome: REGISTRATION_OUTCOME_OK,
                message: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(ack, DomainResponse::Ack);
        assert!(dc.host_registrations().is_connected("host-b"));

        assert_eq!(channel.request(DomainRequest::Ping).await.unwrap(), DomainResponse::Pong);

        connection.close();
        session.await.unwrap().unwrap();
        assert!(!dc.host_registrations().is_connected("host-b"));
    }

    #[tokio::test]
    async fn test_pinger_cancel_ends_session() {
        let (handler, dc) = master();
        let (slave_end, master_end) = tokio::io::duplex(64 * 1024);
        let token = CancellationToken::new();
        let session = tokio::spawn(handle_slave(
            master_end,
            "10.0.0.2:40000".parse().unwrap(),
            handler,
            token.clone(),
        ));

        let connection = FramedDomainConnection::new(slave_end);
        let channel = connection.open_channel().await.unwrap();
        channel
            .request(DomainRequest::RegisterHostController {
                host_id: "host-b".into(),
                host_info: HostInfo::local("host-b"),
            })
            .await
            .unwrap();
        channel
            .request(DomainRequest::CompleteRegistration {
                outcome: REGISTRATION_OUTCOME_OK,
                message: String::new(),
            })
            .await
            .unwrap();

        dc.host_registrations()
            .get_registration("host-b")
            .unwrap()
            .pinger()
            .unwrap()
            .cancel();
        session.await.unwrap().unwrap();

        connection.closed().await;
        assert!(matches!(
            channel.request(DomainRequest::Ping).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_request_fails_when_peer_goes_away() {
        let (slave_end, master_end) = tokio::io::duplex(1024);
        let connection = FramedDomainConnection::new(slave_end);
        let channel = connection.open_channel().await.unwrap();
        drop(master_end);
        assert!(channel.request(DomainRequest::Ping).await.is_err());
        connection.closed().await;
    }
}
