// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server inventory
//!
//! Owns every [`ManagedServer`] of this host, keyed by server name. It is the
//! single entry point for starting, stopping, restarting and reconnecting
//! servers, and routes process controller notifications to the right state
//! machine by process name.
//!
//! Membership changes are announced on a watch channel so `restart_server`
//! and `stop_servers` can wait for removals without polling.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::domain::auth::AuthKey;
use crate::domain::boot::{BootConfigurationError, BootConfigurationFactory, OperationId, OperationIdCounter};
use crate::domain::channel::{RemoteProxyController, ServerChannel};
use crate::domain::domain_controller::{DomainController, DomainControllerError};
use crate::domain::domain_model::DomainModel;
use crate::domain::managed_server::{ManagedServer, ManagedServerError, ServerLifecycleObserver};
use crate::domain::process::{
    is_server_process, process_server_name, ProcessControllerClient, ProcessControllerError,
    ProcessInfo, ProcessMessageHandler, ProcessOperationType,
};
use crate::domain::server_state::{InternalState, RequiredState, ServerStatus};

pub const DEFAULT_INVENTORY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerInventoryError {
    #[error("host controller is already shut down")]
    HostAlreadyShutdown,

    #[error("no server named '{0}'")]
    UnknownServer(String),

    #[error("could not get the server inventory within {0:?}")]
    InventoryTimeout(Duration),

    #[error("server inventory request was abandoned")]
    InventoryCancelled,

    #[error(transparent)]
    ProcessController(#[from] ProcessControllerError),

    #[error(transparent)]
    ManagedServer(#[from] ManagedServerError),

    #[error(transparent)]
    BootConfiguration(#[from] BootConfigurationError),

    #[error(transparent)]
    DomainController(#[from] DomainControllerError),
}

/// Serializable view of one managed server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub server_name: String,
    pub status: ServerStatus,
    pub required: RequiredState,
    pub internal: InternalState,
    pub requires_reload: bool,
}

pub struct ServerInventory {
    host_name: String,
    management_address: SocketAddr,
    servers: DashMap<String, Arc<ManagedServer>>,
    domain_controller: Arc<dyn DomainController>,
    process_controller: Arc<dyn ProcessControllerClient>,
    boot_factory: Arc<dyn BootConfigurationFactory>,
    operation_ids: Arc<OperationIdCounter>,
    observer: Option<Arc<dyn ServerLifecycleObserver>>,
    stopped: AtomicBool,
    connection_finished: AtomicBool,
    membership: watch::Sender<u64>,
    inventory_request: tokio::sync::Mutex<()>,
    pending_inventory: parking_lot::Mutex<Option<oneshot::Sender<HashMap<String, ProcessInfo>>>>,
    inventory_timeout: Duration,
    weak_self: Weak<ServerInventory>,
}

impl ServerInventory {
    pub fn new(
        domain_controller: Arc<dyn DomainController>,
        process_controller: Arc<dyn ProcessControllerClient>,
        boot_factory: Arc<dyn BootConfigurationFactory>,
        operation_ids: Arc<OperationIdCounter>,
        management_address: SocketAddr,
        observer: Option<Arc<dyn ServerLifecycleObserver>>,
        inventory_timeout: Duration,
    ) -> Arc<Self> {
        let (membership, _) = watch::channel(0u64);
        Arc::new_cyclic(|weak_self| Self {
            host_name: domain_controller.local_host_name().to_string(),
            management_address,
            servers: DashMap::new(),
            domain_controller,
            process_controller,
            boot_factory,
            operation_ids,
            observer,
            stopped: AtomicBool::new(false),
            connection_finished: AtomicBool::new(false),
            membership,
            inventory_request: tokio::sync::Mutex::new(()),
            pending_inventory: parking_lot::Mutex::new(None),
            inventory_timeout,
            weak_self: weak_self.clone(),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.connection_finished.load(Ordering::SeqCst)
    }

    pub fn get_server(&self, server_name: &str) -> Option<Arc<ManagedServer>> {
        self.servers.get(server_name).map(|entry| entry.value().clone())
    }

    pub fn determine_server_status(&self, server_name: &str) -> ServerStatus {
        self.get_server(server_name)
            .map(|server| server.status())
            .unwrap_or(ServerStatus::Stopped)
    }

    pub fn server_summaries(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<ServerSummary> = self
            .servers
            .iter()
            .map(|entry| summarize(entry.value()))
            .collect();
        summaries.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        summaries
    }

    pub fn server_summary(&self, server_name: &str) -> Option<ServerSummary> {
        self.get_server(server_name).map(|server| summarize(&server))
    }

    /// Start `server_name`, creating its state machine if needed.
    pub fn start_server(
        &self,
        server_name: &str,
        domain_model: &DomainModel,
    ) -> Result<ServerStatus, ServerInventoryError> {
        self.ensure_running()?;
        counter!("hostctl_server_start_requests_total").increment(1);

        if let Some(existing) = self.get_server(server_name) {
            if existing.status() == ServerStatus::Failed {
                info!(server_name = %server_name, "Restarting failed server");
                existing.start(|| self.boot_factory.create_configuration(server_name, domain_model))?;
            } else {
                info!(
                    server_name = %server_name,
                    status = %existing.status(),
                    "Server is already present"
                );
            }
            return Ok(existing.status());
        }

        let server = match self.insert_if_absent(server_name, AuthKey::generate()) {
            Ok(server) => server,
            Err(existing) => return Ok(existing.status()),
        };

        if let Err(e) = server.start(|| self.boot_factory.create_configuration(server_name, domain_model)) {
            self.remove_entry(server_name, &server);
            return Err(e.into());
        }
        Ok(server.status())
    }

    /// Rebuild a state machine for a process that outlived a host controller
    /// restart.
    pub fn reconnect_server(
        &self,
        server_name: &str,
        domain_model: &DomainModel,
        auth_key: AuthKey,
        running: bool,
        stopping: bool,
    ) -> Result<(), ServerInventoryError> {
        self.ensure_running()?;
        let server = match self.insert_if_absent(server_name, auth_key) {
            Ok(server) => server,
            Err(_) => {
                warn!(server_name = %server_name, "Server already present, not reconnecting");
                return Ok(());
            }
        };

        info!(server_name = %server_name, running, stopping, "Reconnecting server process");
        if !running {
            server.remove_server_process();
        } else if stopping {
            server.set_server_process_stopping();
        } else {
            match self.boot_factory.create_configuration(server_name, domain_model) {
                Ok(config) => server.reconnect_server_process(config),
                Err(e) => {
                    self.remove_entry(server_name, &server);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Ask `server_name` to stop. Does not wait for the process to exit.
    pub fn stop_server(&self, server_name: &str, graceful_timeout: Option<Duration>) -> ServerStatus {
        let Some(server) = self.get_server(server_name) else {
            return ServerStatus::Stopped;
        };
        if let Some(timeout) = graceful_timeout {
            warn!(
                server_name = %server_name,
                timeout_ms = timeout.as_millis() as u64,
                "Graceful shutdown is not supported, stopping immediately"
            );
        }

        server.stop();
        let status = server.status();
        if server.internal_state() == InternalState::Stopped {
            // no process was ever added, nothing will report its removal
            self.remove_entry(server_name, &server);
        }
        status
    }

    /// Stop `server_name`, wait for its entry to go away, then start it.
    pub async fn restart_server(
        &self,
        server_name: &str,
        graceful_timeout: Option<Duration>,
        domain_model: &DomainModel,
    ) -> Result<ServerStatus, ServerInventoryError> {
        self.ensure_running()?;
        self.stop_server(server_name, graceful_timeout);

        let mut membership = self.membership.subscribe();
        loop {
            membership.borrow_and_update();
            self.ensure_running()?;
            if !self.servers.contains_key(server_name) {
                break;
            }
            if membership.changed().await.is_err() {
                break;
            }
        }

        self.start_server(server_name, domain_model)
    }

    /// Stop every server, optionally waiting until all reach a terminal
    /// status or the process controller goes away.
    pub async fn stop_servers(&self, graceful_timeout: Option<Duration>, block_until_stopped: bool) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(servers = self.servers.len(), "Stopping all servers");
            self.notify_membership();
        }

        for server in self.snapshot() {
            self.stop_server(server.server_name(), graceful_timeout);
        }

        if !block_until_stopped {
            return;
        }

        let mut membership = self.membership.subscribe();
        loop {
            membership.borrow_and_update();
            if self.connection_finished.load(Ordering::SeqCst) {
                return;
            }
            let remaining = self
                .snapshot()
                .iter()
                .filter(|server| !server.status().is_terminal())
                .count();
            if remaining == 0 {
                return;
            }
            debug!(remaining, "Waiting for servers to stop");
            if membership.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn shutdown(&self, shutdown_servers: bool, graceful_timeout: Option<Duration>, block_until_stopped: bool) {
        if shutdown_servers && !self.connection_finished.load(Ordering::SeqCst) {
            self.stop_servers(graceful_timeout, block_until_stopped).await;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.notify_membership();
    }

    /// A server opened its management back-channel.
    ///
    /// Returns whether the channel was registered.
    pub fn server_communication_registered(
        &self,
        process_name: &str,
        channel: Arc<dyn ServerChannel>,
    ) -> Result<bool, ServerInventoryError> {
        self.ensure_running()?;
        let server_name = process_server_name(process_name);
        let Some(server) = self.get_server(server_name) else {
            warn!(process_name = %process_name, "No server found for management channel");
            return Ok(false);
        };

        if !server.channel_registered(channel.clone()) {
            warn!(
                server_name = %server_name,
                state = %server.internal_state(),
                "Management channel not expected in current state"
            );
            return Ok(false);
        }
        // a channel that closed meanwhile resolves at once and is handled as current
        self.install_close_handler(&server, channel.clone());

        let proxy = RemoteProxyController::new(&self.host_name, server_name, channel);
        self.domain_controller.register_running_server(proxy)?;
        info!(server_name = %server_name, "Server management channel registered");
        Ok(true)
    }

    /// A server re-opened its back-channel after a reconnect.
    ///
    /// Returns false when the server has to reload.
    pub fn server_reconnected(
        &self,
        process_name: &str,
        channel: Arc<dyn ServerChannel>,
    ) -> Result<bool, ServerInventoryError> {
        let server_name = process_server_name(process_name);
        let server = self
            .get_server(server_name)
            .ok_or_else(|| ServerInventoryError::UnknownServer(server_name.to_string()))?;
        if self.server_communication_registered(process_name, channel)? {
            server.server_started(None);
        }
        Ok(!server.is_requires_reload())
    }

    /// Check a back-channel login of the form `=serverName`.
    pub fn authenticate_server(&self, user: &str, key: &[u8]) -> bool {
        let Some(server_name) = user.strip_prefix('=') else {
            return false;
        };
        self.get_server(server_name)
            .map(|server| server.auth_key().verify(key))
            .unwrap_or(false)
    }

    pub fn server_started(&self, process_name: &str, operation_id: Option<OperationId>) {
        if let Some(server) = self.lookup(process_name) {
            server.server_started(operation_id);
            self.notify_membership();
        }
    }

    pub fn server_start_failed(&self, process_name: &str) {
        if let Some(server) = self.lookup(process_name) {
            server.server_start_failed();
            self.notify_membership();
        }
    }

    pub fn reload_server(&self, server_name: &str, permit: u32) -> Result<bool, ServerInventoryError> {
        let server = self
            .get_server(server_name)
            .ok_or_else(|| ServerInventoryError::UnknownServer(server_name.to_string()))?;
        Ok(server.reload(permit))
    }

    pub fn require_reload(&self, server_name: &str) -> Result<(), ServerInventoryError> {
        let server = self
            .get_server(server_name)
            .ok_or_else(|| ServerInventoryError::UnknownServer(server_name.to_string()))?;
        server.require_reload();
        Ok(())
    }

    /// Ask the process controller for its processes and wait for the answer.
    pub async fn determine_running_processes(
        &self,
        servers_only: bool,
    ) -> Result<HashMap<String, ProcessInfo>, ServerInventoryError> {
        let _serialized = self.inventory_request.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.pending_inventory.lock() = Some(tx);
        if let Err(e) = self.process_controller.request_process_inventory() {
            self.pending_inventory.lock().take();
            return Err(e.into());
        }

        let processes = match tokio::time::timeout(self.inventory_timeout, rx).await {
            Ok(Ok(processes)) => processes,
            Ok(Err(_)) => return Err(ServerInventoryError::InventoryCancelled),
            Err(_) => {
                self.pending_inventory.lock().take();
                return Err(ServerInventoryError::InventoryTimeout(self.inventory_timeout));
            }
        };

        if servers_only {
            Ok(processes
                .into_iter()
                .filter(|(name, _)| is_server_process(name))
                .collect())
        } else {
            Ok(processes)
        }
    }

    fn ensure_running(&self) -> Result<(), ServerInventoryError> {
        if self.is_shut_down() {
            return Err(ServerInventoryError::HostAlreadyShutdown);
        }
        Ok(())
    }

    fn create_managed_server(&self, server_name: &str, auth_key: AuthKey) -> ManagedServer {
        let server = ManagedServer::new(
            server_name,
            self.host_name.clone(),
            auth_key,
            self.management_address,
            self.process_controller.clone(),
            self.operation_ids.clone(),
        );
        match &self.observer {
            Some(observer) => server.with_observer(observer.clone()),
            None => server,
        }
    }

    /// Insert a new state machine, or hand back the one that won the race.
    fn insert_if_absent(
        &self,
        server_name: &str,
        auth_key: AuthKey,
    ) -> Result<Arc<ManagedServer>, Arc<ManagedServer>> {
        let inserted = match self.servers.entry(server_name.to_string()) {
            Entry::Occupied(entry) => Err(entry.get().clone()),
            Entry::Vacant(entry) => {
                let server = Arc::new(self.create_managed_server(server_name, auth_key));
                entry.insert(server.clone());
                Ok(server)
            }
        };
        if inserted.is_ok() {
            gauge!("hostctl_managed_servers").set(self.servers.len() as f64);
            self.notify_membership();
        }
        inserted
    }

    fn remove_entry(&self, server_name: &str, server: &Arc<ManagedServer>) {
        if self
            .servers
            .remove_if(server_name, |_, current| Arc::ptr_eq(current, server))
            .is_some()
        {
            gauge!("hostctl_managed_servers").set(self.servers.len() as f64);
            self.notify_membership();
        }
    }

    fn install_close_handler(&self, server: &Arc<ManagedServer>, channel: Arc<dyn ServerChannel>) {
        let inventory = self.weak_self.clone();
        let server = server.clone();
        tokio::spawn(async move {
            channel.closed().await;
            let Some(inventory) = inventory.upgrade() else {
                return;
            };
            let channel_id = channel.id();
            inventory
                .domain_controller
                .unregister_server_channel(server.server_name(), channel_id);
            let expected = server.callback_unregistered(channel_id, inventory.is_shut_down());
            debug!(
                server_name = %server.server_name(),
                channel = %channel_id,
                expected,
                "Management channel closed"
            );
            inventory.notify_membership();
        });
    }

    fn lookup(&self, process_name: &str) -> Option<Arc<ManagedServer>> {
        if !is_server_process(process_name) {
            debug!(process_name = %process_name, "Ignoring notification for non-server process");
            return None;
        }
        let server = self.get_server(process_server_name(process_name));
        if server.is_none() {
            warn!(process_name = %process_name, "No server found for process notification");
        }
        server
    }

    fn snapshot(&self) -> Vec<Arc<ManagedServer>> {
        self.servers.iter().map(|entry| entry.value().clone()).collect()
    }

    fn notify_membership(&self) {
        self.membership.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl ProcessMessageHandler for ServerInventory {
    fn handle_process_added(&self, process_name: &str) {
        if let Some(server) = self.lookup(process_name) {
            server.process_added();
            self.notify_membership();
        }
    }

    fn handle_process_started(&self, process_name: &str) {
        if let Some(server) = self.lookup(process_name) {
            server.process_started();
            self.notify_membership();
        }
    }

    fn handle_process_stopped(&self, process_name: &str, uptime_millis: u64) {
        if let Some(server) = self.lookup(process_name) {
            info!(server_name = %server.server_name(), uptime_millis, "Server process stopped");
            self.domain_controller.unregister_running_server(server.server_name());
            server.process_finished();
            self.notify_membership();
        }
    }

    fn handle_process_removed(&self, process_name: &str) {
        if let Some(server) = self.lookup(process_name) {
            self.remove_entry(server.server_name(), &server);
            server.process_removed();
            info!(server_name = %server.server_name(), "Server process removed");
        }
    }

    fn handle_process_inventory(&self, processes: HashMap<String, ProcessInfo>) {
        match self.pending_inventory.lock().take() {
            Some(pending) => {
                let _ = pending.send(processes);
            }
            None => debug!("Unsolicited process inventory ignored"),
        }
    }

    fn handle_operation_failed(&self, process_name: &str, operation: ProcessOperationType) {
        let Some(server) = self.lookup(process_name) else {
            return;
        };
        let state = match operation {
            ProcessOperationType::Add => InternalState::ProcessAdding,
            ProcessOperationType::Start => InternalState::ProcessStarting,
            ProcessOperationType::Stop => InternalState::ProcessStopping,
            ProcessOperationType::SendStdin | ProcessOperationType::Reconnect => InternalState::ServerStarting,
            ProcessOperationType::Remove => InternalState::ProcessRemoving,
        };
        warn!(server_name = %server.server_name(), operation = %operation, "Process operation failed");
        server.transition_failed(state);
        self.notify_membership();
    }

    fn handle_connection_shutdown(&self) {
        info!("Process controller connection shut down");
    }

    fn handle_connection_failure(&self, error: &str) {
        error!(error = %error, "Process controller connection failed");
    }

    fn handle_connection_finished(&self) {
        if !self.connection_finished.swap(true, Ordering::SeqCst) {
            warn!("Process controller connection finished");
        }
        self.notify_membership();
    }
}

fn summarize(server: &ManagedServer) -> ServerSummary {
    let state = server.state();
    ServerSummary {
        server_name: server.server_name().to_string(),
        status: state.status(),
        required: state.required,
        internal: state.internal,
        requires_reload: server.is_requires_reload(),
    }
}
