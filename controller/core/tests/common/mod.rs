// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use async_trait::async_trait;
use hostctl_core::application::domain_controller::LocalDomainController;
use hostctl_core::application::server_inventory::{ServerInventory, DEFAULT_INVENTORY_TIMEOUT};
use hostctl_core::domain::auth::AuthKey;
use hostctl_core::domain::boot::{
    BootConfigurationError, BootConfigurationFactory, HostControllerEnvironment, ManagedServerBootConfiguration,
    OperationIdCounter,
};
use hostctl_core::domain::channel::{ChannelError, ChannelId, ManagementOperation, ServerChannel};
use hostctl_core::domain::domain_controller::RunningMode;
use hostctl_core::domain::domain_model::DomainModel;
use hostctl_core::domain::process::{ProcessControllerClient, ProcessControllerError, ProcessInfo};
use hostctl_core::domain::registration::{
    DomainChannel, DomainConnection, DomainConnector, DomainRequest, DomainResponse, TransportError,
};
use hostctl_core::infrastructure::event_bus::EventBus;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;

pub const DOMAIN_MODEL: &str = r#"
server-group:
  main-group:
    profile: default
    launch-command: ["/opt/server/bin/server"]
host:
  host-a:
    server-config:
      server-one:
        group: main-group
      server-two:
        group: main-group
      server-idle:
        group: main-group
        auto-start: false
  host-b:
    server-config:
      server-three:
        group: main-group
"#;

pub fn domain_model() -> DomainModel {
    DomainModel::from_yaml_str(DOMAIN_MODEL).expect("test domain model parses")
}

/// Records every request and answers inventory requests from a canned map.
#[derive(Default)]
pub struct RecordingProcessController {
    calls: Mutex<Vec<String>>,
    handler: Mutex<Option<Weak<ServerInventory>>>,
    inventory: Mutex<Option<HashMap<String, ProcessInfo>>>,
}

impl RecordingProcessController {
    pub fn bind(&self, inventory: &Arc<ServerInventory>) {
        *self.handler.lock().unwrap() = Some(Arc::downgrade(inventory));
    }

    pub fn set_inventory(&self, processes: HashMap<String, ProcessInfo>) {
        *self.inventory.lock().unwrap() = Some(processes);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(' ').next() == Some(call))
            .count()
    }

    fn record(&self, call: &str, process_name: &str) -> Result<(), ProcessControllerError> {
        self.calls.lock().unwrap().push(format!("{call} {process_name}"));
        Ok(())
    }
}

impl ProcessControllerClient for RecordingProcessController {
    fn add_process(
        &self,
        process_name: &str,
        _auth_key: &AuthKey,
        _command: &[String],
        _environment: &HashMap<String, String>,
        _working_directory: &Path,
    ) -> Result<(), ProcessControllerError> {
        self.record("add", process_name)
    }

    fn start_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.record("start", process_name)
    }

    fn stop_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.record("stop", process_name)
    }

    fn remove_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.record("remove", process_name)
    }

    fn destroy_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.record("destroy", process_name)
    }

    fn kill_process(&self, process_name: &str) -> Result<(), ProcessControllerError> {
        self.record("kill", process_name)
    }

    fn reconnect_process(
        &self,
        process_name: &str,
        _management_address: SocketAddr,
        _managed_subsystem_endpoint: bool,
        _auth_key: &AuthKey,
    ) -> Result<(), ProcessControllerError> {
        self.record("reconnect", process_name)
    }

    fn send_stdin(&self, process_name: &str, _payload: Vec<u8>) -> Result<(), ProcessControllerError> {
        self.record("send_stdin", process_name)
    }

    fn request_process_inventory(&self) -> Result<(), ProcessControllerError> {
        use hostctl_core::domain::process::ProcessMessageHandler;

        self.record("inventory", "")?;
        let answer = self.inventory.lock().unwrap().clone().unwrap_or_default();
        let handler = self.handler.lock().unwrap().as_ref().and_then(Weak::upgrade);
        if let Some(handler) = handler {
            handler.handle_process_inventory(answer);
        }
        Ok(())
    }
}

pub struct FixedBootFactory;

impl BootConfigurationFactory for FixedBootFactory {
    fn create_configuration(
        &self,
        server_name: &str,
        _domain_model: &DomainModel,
    ) -> Result<ManagedServerBootConfiguration, BootConfigurationError> {
        if server_name == "unknown" {
            return Err(BootConfigurationError::UnknownServer(server_name.to_string()));
        }
        Ok(ManagedServerBootConfiguration {
            launch_command: vec!["/opt/server/bin/server".into()],
            environment: HashMap::new(),
            working_directory: PathBuf::from("/tmp"),
            host_environment: HostControllerEnvironment {
                host_name: "host-a".into(),
                home_dir: PathBuf::from("/opt/server"),
                base_dir: PathBuf::from("/tmp"),
            },
            managed_subsystem_endpoint: false,
            subsystem_endpoint_configuration: None,
            boot_operations: Vec::new(),
        })
    }
}

pub struct TestHost {
    pub domain_controller: Arc<LocalDomainController>,
    pub process_controller: Arc<RecordingProcessController>,
    pub inventory: Arc<ServerInventory>,
    pub event_bus: EventBus,
}

pub fn test_host(host_name: &str, master: bool, running_mode: RunningMode) -> TestHost {
    let event_bus = EventBus::new(256);
    let domain_controller = Arc::new(LocalDomainController::new(
        host_name,
        master,
        running_mode,
        event_bus.clone(),
    ));
    let process_controller = Arc::new(RecordingProcessController::default());
    let inventory = ServerInventory::new(
        domain_controller.clone(),
        process_controller.clone(),
        Arc::new(FixedBootFactory),
        Arc::new(OperationIdCounter::new()),
        "127.0.0.1:9999".parse().unwrap(),
        Some(Arc::new(event_bus.clone())),
        DEFAULT_INVENTORY_TIMEOUT,
    );
    process_controller.bind(&inventory);
    TestHost {
        domain_controller,
        process_controller,
        inventory,
        event_bus,
    }
}

/// In-memory server back-channel.
#[derive(Debug)]
pub struct TestChannel {
    id: ChannelId,
    sent: Mutex<Vec<ManagementOperation>>,
    closed: CancellationToken,
}

impl TestChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::new(),
            sent: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        })
    }

    pub fn sent(&self) -> Vec<ManagementOperation> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerChannel for TestChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, operation: ManagementOperation) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed(self.id));
        }
        self.sent.lock().unwrap().push(operation);
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// A master that lives in memory. Connection attempts fail while
/// `refuse` is set.
pub struct ScriptedMaster {
    model: DomainModel,
    refuse: Mutex<bool>,
    attempts: Mutex<Vec<tokio::time::Instant>>,
    addresses: Mutex<Vec<String>>,
    doomed: Mutex<u32>,
    connections: Mutex<Vec<Arc<ScriptedConnection>>>,
    requests: Arc<Mutex<Vec<DomainRequest>>>,
}

impl ScriptedMaster {
    pub fn new(model: DomainModel) -> Arc<Self> {
        Arc::new(Self {
            model,
            refuse: Mutex::new(false),
            attempts: Mutex::new(Vec::new()),
            addresses: Mutex::new(Vec::new()),
            doomed: Mutex::new(0),
            connections: Mutex::new(Vec::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn set_refusing(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }

    pub fn attempts(&self) -> Vec<tokio::time::Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<DomainRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Addresses of every connection attempt, in order.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().unwrap().clone()
    }

    /// The next `count` connections close as soon as registration completes.
    pub fn drop_after_registration(&self, count: u32) {
        *self.doomed.lock().unwrap() = count;
    }

    pub fn registrations(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, DomainRequest::RegisterHostController { .. }))
            .count()
    }

    /// Drop the most recent connection as if the network failed.
    pub fn drop_connection(&self) {
        if let Some(connection) = self.connections.lock().unwrap().last() {
            connection.token.cancel();
        }
    }
}

#[async_trait]
impl DomainConnector for ScriptedMaster {
    async fn connect(&self, address: &str) -> Result<Arc<dyn DomainConnection>, TransportError> {
        self.attempts.lock().unwrap().push(tokio::time::Instant::now());
        self.addresses.lock().unwrap().push(address.to_string());
        if *self.refuse.lock().unwrap() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let doomed = {
            let mut doomed = self.doomed.lock().unwrap();
            let drop_it = *doomed > 0;
            *doomed = doomed.saturating_sub(1);
            drop_it
        };
        let connection = Arc::new(ScriptedConnection {
            model: self.model.clone(),
            token: CancellationToken::new(),
            requests: self.requests.clone(),
            doomed,
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

pub struct ScriptedConnection {
    model: DomainModel,
    token: CancellationToken,
    requests: Arc<Mutex<Vec<DomainRequest>>>,
    doomed: bool,
}

#[async_trait]
impl DomainConnection for ScriptedConnection {
    async fn open_channel(&self) -> Result<Arc<dyn DomainChannel>, TransportError> {
        Ok(Arc::new(ScriptedChannel {
            model: self.model.clone(),
            token: self.token.clone(),
            requests: self.requests.clone(),
            doomed: self.doomed,
        }))
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }

    fn close(&self) {
        self.token.cancel();
    }
}

struct ScriptedChannel {
    model: DomainModel,
    token: CancellationToken,
    requests: Arc<Mutex<Vec<DomainRequest>>>,
    doomed: bool,
}

#[async_trait]
impl DomainChannel for ScriptedChannel {
    async fn request(&self, request: DomainRequest) -> Result<DomainResponse, TransportError> {
        if self.token.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(match request {
            DomainRequest::RegisterHostController { .. } => DomainResponse::DomainModel {
                model: self.model.clone(),
            },
            DomainRequest::Ping => DomainResponse::Pong,
            DomainRequest::CompleteRegistration { .. } if self.doomed => {
                self.token.cancel();
                DomainResponse::Ack
            }
            _ => DomainResponse::Ack,
        })
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }

    fn close(&self) {
        self.token.cancel();
    }
}

/// Let spawned tasks run without advancing a paused clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
