// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain controller contract seen by the server inventory.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::channel::{ChannelId, RemoteProxyController};
use crate::domain::domain_model::DomainModel;
use crate::domain::registration::SlaveRegistrationErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningMode {
    #[default]
    Normal,
    AdminOnly,
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningMode::Normal => f.write_str("normal"),
            RunningMode::AdminOnly => f.write_str("admin_only"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DomainControllerError {
    #[error("host '{0}' is not the master domain controller")]
    HostIsNotMaster(String),

    #[error("master domain controller is running in admin-only mode")]
    MasterIsAdminOnly,

    #[error("a host named '{0}' is already registered")]
    HostAlreadyExists(String),
}

impl DomainControllerError {
    /// Code reported to a slave whose registration was refused.
    pub fn registration_code(&self) -> SlaveRegistrationErrorCode {
        match self {
            DomainControllerError::HostIsNotMaster(_) => SlaveRegistrationErrorCode::HostIsNotMaster,
            DomainControllerError::MasterIsAdminOnly => SlaveRegistrationErrorCode::MasterIsAdminOnly,
            DomainControllerError::HostAlreadyExists(_) => SlaveRegistrationErrorCode::HostAlreadyExists,
        }
    }
}

pub trait DomainController: Send + Sync {
    fn local_host_name(&self) -> &str;

    fn domain_model(&self) -> DomainModel;

    /// Publish a running server in the domain's server registry.
    fn register_running_server(&self, proxy: RemoteProxyController) -> Result<(), DomainControllerError>;

    fn unregister_running_server(&self, server_name: &str);

    /// Drop the registered proxy only if it still uses `channel_id`.
    fn unregister_server_channel(&self, server_name: &str, channel_id: ChannelId);
}
