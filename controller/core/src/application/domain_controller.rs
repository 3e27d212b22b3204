// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local domain controller
//!
//! Holds this host's view of the domain: the current domain model, the
//! registry of running server proxies and, on a master, the slave hosts
//! registered with it. On a slave it is also the callback that installs the
//! model received from the master.

use chrono::Utc;
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::remote_domain_connection::HostRegistrationCallback;
use crate::domain::channel::{ChannelId, ProxyAddress, RemoteProxyController};
use crate::domain::domain_controller::{DomainController, DomainControllerError, RunningMode};
use crate::domain::domain_model::DomainModel;
use crate::domain::events::{DomainConnectionEvent, ServerLifecycleEvent};
use crate::domain::host_registrations::{
    DomainSlaveHostRegistrations, HostConnectionEvent, HostConnectionEventType, HostPinger,
};
use crate::domain::registration::HostInfo;
use crate::infrastructure::event_bus::EventBus;

pub struct LocalDomainController {
    host_name: String,
    master: bool,
    running_mode: RunningMode,
    domain_model: RwLock<DomainModel>,
    running_servers: Mutex<HashMap<String, RemoteProxyController>>,
    slave_hosts: Mutex<HashMap<String, HostInfo>>,
    host_registrations: Arc<DomainSlaveHostRegistrations>,
    event_bus: EventBus,
}

impl LocalDomainController {
    pub fn new(host_name: impl Into<String>, master: bool, running_mode: RunningMode, event_bus: EventBus) -> Self {
        Self {
            host_name: host_name.into(),
            master,
            running_mode,
            domain_model: RwLock::new(DomainModel::default()),
            running_servers: Mutex::new(HashMap::new()),
            slave_hosts: Mutex::new(HashMap::new()),
            host_registrations: Arc::new(DomainSlaveHostRegistrations::new()),
            event_bus,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn running_mode(&self) -> RunningMode {
        self.running_mode
    }

    pub fn set_domain_model(&self, model: DomainModel) {
        *self.domain_model.write() = model;
    }

    pub fn host_registrations(&self) -> &Arc<DomainSlaveHostRegistrations> {
        &self.host_registrations
    }

    pub fn running_servers(&self) -> Vec<ProxyAddress> {
        let mut addresses: Vec<ProxyAddress> = self
            .running_servers
            .lock()
            .values()
            .map(|proxy| proxy.address().clone())
            .collect();
        addresses.sort_by(|a, b| a.server.cmp(&b.server));
        addresses
    }

    pub fn running_server(&self, server_name: &str) -> Option<RemoteProxyController> {
        self.running_servers.lock().get(server_name).cloned()
    }

    pub fn slave_hosts(&self) -> Vec<HostInfo> {
        let mut hosts: Vec<HostInfo> = self.slave_hosts.lock().values().cloned().collect();
        hosts.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        hosts
    }

    /// Reject a slave registration this master cannot accept.
    pub fn check_registration_allowed(&self, host_name: &str) -> Result<(), DomainControllerError> {
        if !self.master {
            return Err(DomainControllerError::HostIsNotMaster(self.host_name.clone()));
        }
        if self.running_mode == RunningMode::AdminOnly {
            return Err(DomainControllerError::MasterIsAdminOnly);
        }
        if host_name == self.host_name || self.slave_hosts.lock().contains_key(host_name) {
            return Err(DomainControllerError::HostAlreadyExists(host_name.to_string()));
        }
        Ok(())
    }

    /// Record a slave whose registration completed.
    pub fn register_remote_host(
        &self,
        host_info: HostInfo,
        pinger: Arc<dyn HostPinger>,
        address: SocketAddr,
    ) -> Result<(), DomainControllerError> {
        let host_name = host_info.host_name.clone();
        {
            let mut hosts = self.slave_hosts.lock();
            if hosts.contains_key(&host_name) {
                return Err(DomainControllerError::HostAlreadyExists(host_name));
            }
            hosts.insert(host_name.clone(), host_info);
            gauge!("hostctl_slave_hosts_registered").set(hosts.len() as f64);
        }
        self.host_registrations.register_host(&host_name, pinger, address);
        info!(host_name = %host_name, address = %address, "Slave host registered");
        self.event_bus
            .publish_connection_event(DomainConnectionEvent::SlaveRegistered {
                host_name,
                registered_at: Utc::now(),
            });
        Ok(())
    }

    /// Forget a slave. Returns false if it was not registered.
    pub fn unregister_remote_host(&self, host_name: &str, event: HostConnectionEvent) -> bool {
        let removed = {
            let mut hosts = self.slave_hosts.lock();
            let removed = hosts.remove(host_name).is_some();
            gauge!("hostctl_slave_hosts_registered").set(hosts.len() as f64);
            removed
        };
        if !removed {
            debug!(host_name = %host_name, "Unregister of unknown slave host ignored");
            return false;
        }

        if let Some(pinger) = self
            .host_registrations
            .get_registration(host_name)
            .and_then(|registration| registration.pinger().cloned())
        {
            pinger.cancel();
        }
        let reason = format!("{:?}", event.event_type);
        self.host_registrations.unregister_host(host_name, event);
        info!(host_name = %host_name, reason = %reason, "Slave host unregistered");
        self.event_bus
            .publish_connection_event(DomainConnectionEvent::SlaveUnregistered {
                host_name: host_name.to_string(),
                reason,
                unregistered_at: Utc::now(),
            });
        true
    }

    /// Note a failed registration attempt against `host_name`.
    pub fn registration_failed(&self, host_name: &str, message: impl Into<String>) {
        self.host_registrations.add_event(
            host_name,
            HostConnectionEvent::now(HostConnectionEventType::RegistrationFailed).with_message(message),
        );
    }
}

impl DomainController for LocalDomainController {
    fn local_host_name(&self) -> &str {
        &self.host_name
    }

    fn domain_model(&self) -> DomainModel {
        self.domain_model.read().clone()
    }

    fn register_running_server(&self, proxy: RemoteProxyController) -> Result<(), DomainControllerError> {
        let server_name = proxy.address().server.clone();
        if let Some(previous) = self.running_servers.lock().insert(server_name.clone(), proxy) {
            debug!(server_name = %server_name, previous = %previous.channel_id(), "Replaced running server proxy");
        }
        self.event_bus
            .publish_server_event(ServerLifecycleEvent::ServerRegistered {
                server_name,
                registered_at: Utc::now(),
            });
        Ok(())
    }

    fn unregister_running_server(&self, server_name: &str) {
        if self.running_servers.lock().remove(server_name).is_some() {
            self.event_bus
                .publish_server_event(ServerLifecycleEvent::ServerUnregistered {
                    server_name: server_name.to_string(),
                    unregistered_at: Utc::now(),
                });
        }
    }

    fn unregister_server_channel(&self, server_name: &str, channel_id: ChannelId) {
        let removed = {
            let mut servers = self.running_servers.lock();
            match servers.get(server_name) {
                Some(proxy) if proxy.channel_id() == channel_id => servers.remove(server_name).is_some(),
                _ => false,
            }
        };
        if removed {
            self.event_bus
                .publish_server_event(ServerLifecycleEvent::ServerUnregistered {
                    server_name: server_name.to_string(),
                    unregistered_at: Utc::now(),
                });
        }
    }
}

impl HostRegistrationCallback for LocalDomainController {
    fn apply_domain_model(&self, model: DomainModel) -> bool {
        if !model.as_value().is_object() {
            warn!("Domain model from master is not a mapping");
            return false;
        }
        let hosts = model.host_names();
        if !hosts.iter().any(|host| host == &self.host_name) {
            debug!(host_name = %self.host_name, "Domain model has no entry for this host");
        }
        self.set_domain_model(model);
        info!(host_name = %self.host_name, "Applied domain model from master");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel::{ChannelError, ManagementOperation, ServerChannel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct StubChannel(ChannelId);

    #[async_trait]
    impl ServerChannel for StubChannel {
        fn id(&self) -> ChannelId {
            self.0
        }

        fn send(&self, _operation: ManagementOperation) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn closed(&self) {
            futures::future::pending::<()>().await
        }

        fn close(&self) {}
    }

    #[derive(Debug, Default)]
    struct FlagPinger(AtomicBool);

    impl HostPinger for FlagPinger {
        fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn master() -> LocalDomainController {
        LocalDomainController::new("host-a", true, RunningMode::Normal, EventBus::new(16))
    }

    #[test]
    fn test_registration_rules() {
        let slave = LocalDomainController::new("host-b", false, RunningMode::Normal, EventBus::new(16));
        assert!(matches!(
            slave.check_registration_allowed("host-c"),
            Err(DomainControllerError::HostIsNotMaster(_))
        ));

        let admin = LocalDomainController::new("host-a", true, RunningMode::AdminOnly, EventBus::new(16));
        assert!(matches!(
            admin.check_registration_allowed("host-c"),
            Err(DomainControllerError::MasterIsAdminOnly)
        ));

        let master = master();
        assert!(master.check_registration_allowed("host-c").is_ok());
        assert!(matches!(
            master.check_registration_allowed("host-a"),
            Err(DomainControllerError::HostAlreadyExists(_))
        ));
    }

    #[test]
    fn test_remote_host_register_and_unregister() {
        let master = master();
        let pinger = Arc::new(FlagPinger::default());
        master
            .register_remote_host(HostInfo::local("host-c"), pinger.clone(), "10.0.0.3:41000".parse().unwrap())
            .unwrap();

        assert!(master.host_registrations().is_connected("host-c"));
        assert!(matches!(
            master.check_registration_allowed("host-c"),
            Err(DomainControllerError::HostAlreadyExists(_))
        ));

        assert!(master.unregister_remote_host(
            "host-c",
            HostConnectionEvent::now(HostConnectionEventType::Unregistered)
        ));
        assert!(pinger.0.load(Ordering::SeqCst));
        assert!(!master.host_registrations().is_connected("host-c"));
        assert!(master.slave_hosts().is_empty());
        assert!(!master.unregister_remote_host(
            "host-c",
            HostConnectionEvent::now(HostConnectionEventType::Unregistered)
        ));
    }

    #[test]
    fn test_stale_channel_does_not_unregister_replacement() {
        let master = master();
        let old = ChannelId::new();
        let new = ChannelId::new();
        master
            .register_running_server(RemoteProxyController::new("host-a", "server-one", Arc::new(StubChannel(old))))
            .unwrap();
        master
            .register_running_server(RemoteProxyController::new("host-a", "server-one", Arc::new(StubChannel(new))))
            .unwrap();

        master.unregister_server_channel("server-one", old);
        assert_eq!(master.running_server("server-one").unwrap().channel_id(), new);

        master.unregister_server_channel("server-one", new);
        assert!(master.running_server("server-one").is_none());
    }

    #[test]
    fn test_apply_domain_model() {
        let slave = LocalDomainController::new("host-b", false, RunningMode::Normal, EventBus::new(16));
        assert!(!slave.apply_domain_model(DomainModel::new(serde_json::json!("nope"))));

        let model = DomainModel::from_yaml_str("host:\n  host-b:\n    server-config: {}\n").unwrap();
        assert!(slave.apply_domain_model(model.clone()));
        assert_eq!(slave.domain_model(), model);
    }
}
