// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Remote Domain Connection - slave side of the master registration protocol
//
// A slave host opens a connection and a channel to the master, registers,
// applies the domain model it receives and confirms the outcome. Once
// registered the connection is "armed": an unexpected close of either the
// connection or the channel starts a background reconnect loop that retries
// until it succeeds or close() disarms it.
//
// Each successful connect bumps a generation counter. Close watchers carry
// the generation they were installed for, so a late close of a replaced
// connection never schedules a reconnect. The running-loop flag lives under
// the same lock as the connection, and is cleared before a new connection is
// published, so a close of that connection always finds no loop running.

use chrono::Utc;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::domain_model::DomainModel;
use crate::domain::events::DomainConnectionEvent;
use crate::domain::registration::{
    DomainChannel, DomainConnection, DomainConnector, DomainRequest, DomainResponse, HostInfo,
    SlaveRegistrationError, SlaveRegistrationErrorCode, TransportError, REGISTRATION_OUTCOME_FAILED,
    REGISTRATION_OUTCOME_OK,
};
use crate::infrastructure::event_bus::EventBus;

const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff strategies between connection attempts. Attempts count from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Initial registration: short fixed steps.
    Connect,
    /// After a lost connection: `min(attempt², 15)` seconds.
    Reconnect,
}

impl ReconnectPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Connect => match attempt {
                0..=5 => Duration::from_millis(100),
                6..=10 => Duration::from_millis(300),
                11..=15 => Duration::from_millis(1000),
                _ => Duration::from_millis(5000),
            },
            ReconnectPolicy::Reconnect => {
                let squared = u64::from(attempt).saturating_mul(u64::from(attempt));
                Duration::from_secs(squared.min(15))
            }
        }
    }

    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.backoff(attempt)).await;
    }
}

/// Applies the domain model received from the master.
pub trait HostRegistrationCallback: Send + Sync {
    /// Returns false when the model could not be applied locally.
    fn apply_domain_model(&self, model: DomainModel) -> bool;
}

#[derive(Debug, Error)]
pub enum RemoteConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("master refused registration: {0}")]
    Registration(#[from] SlaveRegistrationError),

    #[error("unexpected response from master: {0}")]
    UnexpectedResponse(String),

    #[error("domain model from master could not be applied")]
    ModelRejected,

    #[error("connection to master is closed")]
    Closed,

    #[error("could not register with master at {address} within {timeout:?}: {source}")]
    RegisterTimeout {
        address: String,
        timeout: Duration,
        #[source]
        source: Box<RemoteConnectionError>,
    },
}

impl RemoteConnectionError {
    /// Errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            RemoteConnectionError::Transport(TransportError::Authentication(_)) => true,
            RemoteConnectionError::Registration(e) => e.code == SlaveRegistrationErrorCode::HostAlreadyExists,
            RemoteConnectionError::ModelRejected => true,
            RemoteConnectionError::Closed => true,
            _ => false,
        }
    }

    pub fn registration_code(&self) -> Option<SlaveRegistrationErrorCode> {
        match self {
            RemoteConnectionError::Registration(e) => Some(e.code),
            RemoteConnectionError::RegisterTimeout { source, .. } => source.registration_code(),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<Arc<dyn DomainConnection>>,
    channel: Option<Arc<dyn DomainChannel>>,
    generation: u64,
    reconnecting: bool,
}

pub struct RemoteDomainConnection {
    host_info: HostInfo,
    address: RwLock<String>,
    connector: Arc<dyn DomainConnector>,
    callback: Arc<dyn HostRegistrationCallback>,
    event_bus: EventBus,
    heartbeat_interval: Option<Duration>,
    state: Mutex<ConnectionState>,
    reconnect: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    weak_self: Weak<RemoteDomainConnection>,
}

impl RemoteDomainConnection {
    pub fn new(
        host_info: HostInfo,
        address: impl Into<String>,
        connector: Arc<dyn DomainConnector>,
        callback: Arc<dyn HostRegistrationCallback>,
        event_bus: EventBus,
        heartbeat_interval: Option<Duration>,
    ) -> Arc<Self> {
        let address = address.into();
        Arc::new_cyclic(|weak_self| Self {
            host_info,
            address: RwLock::new(address),
            connector,
            callback,
            event_bus,
            heartbeat_interval,
            state: Mutex::new(ConnectionState::default()),
            reconnect: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_info.host_name
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    /// Whether a lost connection will be re-established automatically.
    pub fn is_armed(&self) -> bool {
        self.reconnect.load(Ordering::SeqCst)
    }

    /// Connect and register with the master.
    pub async fn connect(&self) -> Result<(), RemoteConnectionError> {
        let _serialized = self.connect_lock.lock().await;
        self.connect_locked().await
    }

    /// Disarm reconnection, unregister from the master and close the
    /// transport. The unregister is best effort.
    pub async fn close(&self) {
        self.reconnect.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let (connection, channel) = {
            let mut state = self.state.lock();
            state.generation += 1;
            (state.connection.take(), state.channel.take())
        };

        if let Some(channel) = &channel {
            let request = DomainRequest::UnregisterHostController {
                host_id: self.host_info.host_name.clone(),
            };
            match tokio::time::timeout(UNREGISTER_TIMEOUT, channel.request(request)).await {
                Ok(Ok(_)) => info!(host_name = %self.host_info.host_name, "Unregistered from master"),
                Ok(Err(e)) => warn!(error = %e, "Failed to unregister from master"),
                Err(_) => warn!("Timed out unregistering from master"),
            }
            channel.close();
        }
        if let Some(connection) = connection {
            connection.close();
        }
    }

    /// Point at a new master address. The current connection is closed so
    /// the reconnect loop picks up the new address.
    pub fn reconfigure(&self, address: impl Into<String>) {
        let address = address.into();
        info!(address = %address, "Reconfiguring master address");
        *self.address.write() = address;

        let (connection, channel) = {
            let state = self.state.lock();
            (state.connection.clone(), state.channel.clone())
        };
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(connection) = connection {
            connection.close();
        }
    }

    async fn connect_locked(&self) -> Result<(), RemoteConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(RemoteConnectionError::Closed);
        }

        let address = self.address();
        let connection = self.connector.connect(&address).await?;
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                connection.close();
                return Err(e.into());
            }
        };

        if let Err(e) = self.register(&channel).await {
            channel.close();
            connection.close();
            return Err(e);
        }

        if self.shutdown.is_cancelled() {
            channel.close();
            connection.close();
            return Err(RemoteConnectionError::Closed);
        }

        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.connection = Some(connection.clone());
            state.channel = Some(channel.clone());
            state.reconnecting = false;
            state.generation
        };
        self.reconnect.store(true, Ordering::SeqCst);
        self.watch_close(generation, connection, channel.clone());
        if let Some(interval) = self.heartbeat_interval {
            self.spawn_heartbeat(generation, channel, interval);
        }

        info!(host_name = %self.host_info.host_name, master = %address, "Registered with master");
        self.event_bus
            .publish_connection_event(DomainConnectionEvent::RegisteredWithMaster {
                host_name: self.host_info.host_name.clone(),
                master_address: address,
                registered_at: Utc::now(),
            });
        Ok(())
    }

    async fn register(&self, channel: &Arc<dyn DomainChannel>) -> Result<(), RemoteConnectionError> {
        let response = channel
            .request(DomainRequest::RegisterHostController {
                host_id: self.host_info.host_name.clone(),
                host_info: self.host_info.clone(),
            })
            .await?;

        let model = match response {
            DomainResponse::DomainModel { model } => model,
            DomainResponse::RegistrationFailed { code, message } => {
                return Err(SlaveRegistrationError::new(code, message).into());
            }
            other => return Err(RemoteConnectionError::UnexpectedResponse(format!("{other:?}"))),
        };

        let applied = self.callback.apply_domain_model(model);
        let (outcome, message) = if applied {
            (REGISTRATION_OUTCOME_OK, String::new())
        } else {
            (REGISTRATION_OUTCOME_FAILED, "failed to apply domain model".to_string())
        };

        match channel
            .request(DomainRequest::CompleteRegistration { outcome, message })
            .await?
        {
            DomainResponse::Ack => {}
            DomainResponse::RegistrationFailed { code, message } => {
                return Err(SlaveRegistrationError::new(code, message).into());
            }
            other => return Err(RemoteConnectionError::UnexpectedResponse(format!("{other:?}"))),
        }

        if !applied {
            return Err(RemoteConnectionError::ModelRejected);
        }
        Ok(())
    }

    fn watch_close(&self, generation: u64, connection: Arc<dyn DomainConnection>, channel: Arc<dyn DomainChannel>) {
        let this = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection.closed() => {}
                _ = channel.closed() => {}
                _ = shutdown.cancelled() => return,
            }
            if let Some(this) = this.upgrade() {
                this.connection_closed(generation);
            }
        });
    }

    fn spawn_heartbeat(&self, generation: u64, channel: Arc<dyn DomainChannel>, interval: Duration) {
        let this = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = channel.closed() => return,
                    _ = shutdown.cancelled() => return,
                }
                let current = this
                    .upgrade()
                    .map(|this| this.state.lock().generation == generation)
                    .unwrap_or(false);
                if !current {
                    return;
                }
                match tokio::time::timeout(interval, channel.request(DomainRequest::Ping)).await {
                    Ok(Ok(DomainResponse::Pong)) => debug!("Master heartbeat ok"),
                    Ok(Ok(other)) => {
                        warn!(response = ?other, "Unexpected heartbeat response, closing channel");
                        channel.close();
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Master heartbeat failed, closing channel");
                        channel.close();
                        return;
                    }
                    Err(_) => {
                        warn!("Master heartbeat timed out, closing channel");
                        channel.close();
                        return;
                    }
                }
            }
        });
    }

    fn connection_closed(&self, generation: u64) {
        let armed = self.reconnect.load(Ordering::SeqCst);
        let (connection, channel, start_loop) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            let start_loop = armed && !state.reconnecting;
            if start_loop {
                state.reconnecting = true;
            }
            (state.connection.take(), state.channel.take(), start_loop)
        };
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(connection) = connection {
            connection.close();
        }

        if !armed {
            debug!("Master connection closed while disarmed");
            return;
        }

        let address = self.address();
        warn!(master = %address, "Lost connection to master");
        self.event_bus
            .publish_connection_event(DomainConnectionEvent::MasterConnectionLost {
                master_address: address,
                lost_at: Utc::now(),
            });

        if !start_loop {
            return;
        }
        match self.weak_self.upgrade() {
            Some(this) => {
                tokio::spawn(this.reconnect_loop());
            }
            None => self.state.lock().reconnecting = false,
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let backoff = ReconnectPolicy::Reconnect.backoff(attempt);
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Waiting before reconnecting to master");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => break,
            }
            if !self.reconnect.load(Ordering::SeqCst) {
                break;
            }

            counter!("hostctl_master_reconnect_attempts_total").increment(1);
            let result = {
                let _serialized = self.connect_lock.lock().await;
                if !self.reconnect.load(Ordering::SeqCst) {
                    break;
                }
                if self.is_connected() {
                    // connected by another caller, which cleared the flag
                    return;
                }
                self.connect_locked().await
            };
            match result {
                // connect_locked cleared the flag when it published the connection
                Ok(()) => {
                    info!(attempt, "Reconnected to master");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Failed to reconnect to master"),
            }
        }
        self.state.lock().reconnecting = false;
    }
}

/// Registration entry point used at boot.
pub struct RemoteDomainConnectionService {
    connection: Arc<RemoteDomainConnection>,
    register_timeout: Duration,
}

impl RemoteDomainConnectionService {
    pub fn new(connection: Arc<RemoteDomainConnection>, register_timeout: Duration) -> Self {
        Self {
            connection,
            register_timeout,
        }
    }

    pub fn connection(&self) -> &Arc<RemoteDomainConnection> {
        &self.connection
    }

    /// Register with the master, retrying transient failures until
    /// `register_timeout` runs out.
    pub async fn register(&self) -> Result<(), RemoteConnectionError> {
        let deadline = tokio::time::Instant::now() + self.register_timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let error = match self.connection.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            let backoff = ReconnectPolicy::Connect.backoff(attempt);
            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(RemoteConnectionError::RegisterTimeout {
                    address: self.connection.address(),
                    timeout: self.register_timeout,
                    source: Box::new(error),
                });
            }
            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Could not register with master, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    pub async fn unregister(&self) {
        self.connection.close().await;
    }
}
