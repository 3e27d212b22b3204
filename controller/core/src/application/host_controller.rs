// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Host Controller - boot sequence and role selection
//
// Boot order:
// 1. Obtain the domain model: loaded locally on a master or a slave using a
//    cached model, otherwise received by registering with the master.
// 2. In normal running mode, re-attach to server processes that survived a
//    previous host controller, then start every auto-start server.
//
// A slave that cannot register aborts boot, unless the host runs admin-only,
// in which case it continues without a domain controller connection.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::application::domain_controller::LocalDomainController;
use crate::application::remote_domain_connection::{
    RemoteConnectionError, RemoteDomainConnection, RemoteDomainConnectionService,
};
use crate::application::server_inventory::ServerInventory;
use crate::domain::auth::AuthKey;
use crate::domain::domain_controller::{DomainController, RunningMode};
use crate::domain::domain_model::DomainModel;
use crate::domain::host_config::HostConfigManifest;
use crate::domain::process::process_server_name;
use crate::domain::registration::{DomainConnector, HostInfo};
use crate::domain::server_state::ServerStatus;
use crate::infrastructure::event_bus::EventBus;

/// Process exit code when the host controller cannot boot.
pub const HOST_CONTROLLER_ABORT_EXIT_CODE: i32 = 99;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("failed to load domain model from {path}: {message}")]
    DomainModel { path: PathBuf, message: String },

    #[error("slave host '{0}' has no domain controller address")]
    NoDomainController(String),

    #[error("failed to register with the master domain controller: {0}")]
    Registration(#[from] RemoteConnectionError),
}

impl BootError {
    pub fn exit_code(&self) -> i32 {
        HOST_CONTROLLER_ABORT_EXIT_CODE
    }
}

pub struct HostController {
    config: HostConfigManifest,
    domain_controller: Arc<LocalDomainController>,
    inventory: Arc<ServerInventory>,
    connector: Arc<dyn DomainConnector>,
    event_bus: EventBus,
    remote: Mutex<Option<Arc<RemoteDomainConnectionService>>>,
}

impl HostController {
    pub fn new(
        config: HostConfigManifest,
        domain_controller: Arc<LocalDomainController>,
        inventory: Arc<ServerInventory>,
        connector: Arc<dyn DomainConnector>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            config,
            domain_controller,
            inventory,
            connector,
            event_bus,
            remote: Mutex::new(None),
        }
    }

    pub fn domain_controller(&self) -> &Arc<LocalDomainController> {
        &self.domain_controller
    }

    pub fn inventory(&self) -> &Arc<ServerInventory> {
        &self.inventory
    }

    pub fn master_connection(&self) -> Option<Arc<RemoteDomainConnectionService>> {
        self.remote.lock().clone()
    }

    fn running_mode(&self) -> RunningMode {
        self.config.spec.host.running_mode
    }

    pub async fn boot(&self) -> Result<(), BootError> {
        let host = &self.config.spec.host;
        info!(
            host_name = %host.name,
            master = host.master,
            running_mode = %host.running_mode,
            "Booting host controller"
        );

        if host.master || host.use_cached_domain_model {
            match self.load_local_model() {
                Ok(model) => self.domain_controller.set_domain_model(model),
                Err(e) if self.running_mode() == RunningMode::AdminOnly => {
                    warn!(error = %e, "Continuing admin-only boot without a domain model");
                }
                Err(e) => return Err(e),
            }
        } else {
            self.register_with_master().await?;
        }

        if self.running_mode() == RunningMode::Normal {
            self.reconnect_running_servers().await;
            self.start_servers();
        } else {
            info!("Running admin-only, servers will not be started");
        }
        Ok(())
    }

    /// Start every server configured for this host. Servers without
    /// `auto-start` are reported disabled.
    pub fn start_servers(&self) -> Vec<(String, ServerStatus)> {
        let model = self.domain_controller.domain_model();
        let host_name = self.domain_controller.local_host_name();
        let mut statuses = Vec::new();

        for server in model.host_servers(host_name) {
            if !server.auto_start {
                info!(server_name = %server.name, "Server is not auto-start, leaving it stopped");
                statuses.push((server.name, ServerStatus::Disabled));
                continue;
            }
            let status = match self.inventory.start_server(&server.name, &model) {
                Ok(status) => status,
                Err(e) => {
                    error!(server_name = %server.name, error = %e, "Failed to start server");
                    ServerStatus::Failed
                }
            };
            statuses.push((server.name, status));
        }
        statuses
    }

    /// Unregister from the master, then stop all servers, waiting at most
    /// `stop_timeout` for them.
    pub async fn shutdown(&self, stop_timeout: Duration) {
        let remote = self.remote.lock().take();
        if let Some(remote) = remote {
            remote.unregister().await;
        }

        if tokio::time::timeout(stop_timeout, self.inventory.shutdown(true, None, true))
            .await
            .is_err()
        {
            warn!(
                timeout_ms = stop_timeout.as_millis() as u64,
                "Timed out waiting for servers to stop"
            );
        }
        info!("Host controller shut down");
    }

    fn load_local_model(&self) -> Result<DomainModel, BootError> {
        match &self.config.spec.host.domain_model_path {
            Some(path) => {
                let model = DomainModel::from_yaml_file(path).map_err(|e| BootError::DomainModel {
                    path: path.clone(),
                    message: format!("{e:#}"),
                })?;
                info!(path = %path.display(), "Loaded local domain model");
                Ok(model)
            }
            None => {
                info!("No domain model path configured, starting with an empty model");
                Ok(DomainModel::default())
            }
        }
    }

    async fn register_with_master(&self) -> Result<(), BootError> {
        let host = &self.config.spec.host;
        let Some(dc_config) = &self.config.spec.domain_controller else {
            return Err(BootError::NoDomainController(host.name.clone()));
        };

        let connection = RemoteDomainConnection::new(
            HostInfo::local(host.name.clone()),
            dc_config.address.clone(),
            self.connector.clone(),
            self.domain_controller.clone(),
            self.event_bus.clone(),
            dc_config.heartbeat_interval,
        );
        let service = Arc::new(RemoteDomainConnectionService::new(
            connection,
            dc_config.register_timeout,
        ));

        match service.register().await {
            Ok(()) => {
                *self.remote.lock() = Some(service);
                Ok(())
            }
            Err(e) if self.running_mode() == RunningMode::AdminOnly => {
                warn!(error = %e, "Continuing admin-only boot without a domain controller connection");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Could not register with master domain controller");
                Err(e.into())
            }
        }
    }

    /// Re-attach to server processes the process controller still tracks.
    async fn reconnect_running_servers(&self) {
        let processes = match self.inventory.determine_running_processes(true).await {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "Could not determine running server processes");
                return;
            }
        };
        if processes.is_empty() {
            return;
        }

        let model = self.domain_controller.domain_model();
        for (process_name, info) in processes {
            let server_name = process_server_name(&process_name);
            let Some(auth_key) = AuthKey::from_base64(&info.auth_key) else {
                warn!(process_name = %process_name, "Running process has an unreadable auth key");
                continue;
            };
            if let Err(e) =
                self.inventory
                    .reconnect_server(server_name, &model, auth_key, info.running, info.stopping)
            {
                warn!(server_name = %server_name, error = %e, "Failed to reconnect server");
            }
        }
    }
}
