// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Boot configuration handed from the boot command factory to a managed
//! server, and the operation counter used to correlate boots with the
//! server's own "started" report.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::domain::channel::ManagementOperation;
use crate::domain::domain_model::DomainModel;

/// Correlation token for one boot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic source of [`OperationId`]s shared by the inventory and the
/// boot command factory.
#[derive(Debug, Default)]
pub struct OperationIdCounter {
    last: AtomicU64,
}

impl OperationIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> OperationId {
        OperationId(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn current(&self) -> OperationId {
        OperationId(self.last.load(Ordering::SeqCst))
    }
}

/// Paths and identity of the host controller process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostControllerEnvironment {
    pub host_name: String,
    pub home_dir: PathBuf,
    pub base_dir: PathBuf,
}

impl HostControllerEnvironment {
    pub fn server_base_dir(&self, server_name: &str) -> PathBuf {
        self.base_dir.join("servers").join(server_name)
    }
}

/// Everything needed to launch one server, captured at `start()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedServerBootConfiguration {
    pub launch_command: Vec<String>,
    pub environment: HashMap<String, String>,
    pub working_directory: PathBuf,
    pub host_environment: HostControllerEnvironment,
    pub managed_subsystem_endpoint: bool,
    pub subsystem_endpoint_configuration: Option<Value>,
    pub boot_operations: Vec<ManagementOperation>,
}

#[derive(Debug, Error)]
pub enum BootConfigurationError {
    #[error("server '{0}' is not configured on this host")]
    UnknownServer(String),

    #[error("server '{server}' references unknown server group '{group}'")]
    UnknownServerGroup { server: String, group: String },

    #[error("server group '{0}' has no launch command")]
    MissingLaunchCommand(String),
}

/// Produces boot configurations from the domain model.
pub trait BootConfigurationFactory: Send + Sync {
    fn create_configuration(
        &self,
        server_name: &str,
        domain_model: &DomainModel,
    ) -> Result<ManagedServerBootConfiguration, BootConfigurationError>;
}

/// Written to the child's stdin once its process has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerBootPayload {
    pub host_name: String,
    pub server_name: String,
    pub management_address: String,
    pub auth_key: String,
    pub operation_id: Option<OperationId>,
    pub managed_subsystem_endpoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem_endpoint_configuration: Option<Value>,
    pub boot_operations: Vec<ManagementOperation>,
}
