// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Management back-channel of a running server
//!
//! A started server connects back to its host controller. Once the channel is
//! registered it is wrapped in a [`RemoteProxyController`] and published in
//! the domain controller's running-server registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::boot::OperationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A management operation addressed to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagementOperation {
    pub operation: String,
    #[serde(default)]
    pub address: Vec<(String, String)>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
}

impl ManagementOperation {
    pub fn new(operation: impl Into<String>, address: Vec<(String, String)>) -> Self {
        Self {
            operation: operation.into(),
            address,
            parameters: Value::Null,
            operation_id: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Reload of the whole server, correlated by `permit`.
    pub fn reload(permit: u32, operation_id: Option<OperationId>) -> Self {
        Self {
            operation: "reload".to_string(),
            address: Vec::new(),
            parameters: serde_json::json!({ "permit": permit }),
            operation_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(ChannelId),

    #[error("failed to encode management operation: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ServerChannel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    /// Queue an operation for the server. Does not wait for its result.
    fn send(&self, operation: ManagementOperation) -> Result<(), ChannelError>;

    /// Resolves once the channel has closed, for whatever reason.
    async fn closed(&self);

    fn close(&self);
}

/// Address of a running server in the domain management tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAddress {
    pub host: String,
    pub server: String,
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host={}/server={}", self.host, self.server)
    }
}

/// Running server exposed to the domain through its back-channel.
#[derive(Debug, Clone)]
pub struct RemoteProxyController {
    address: ProxyAddress,
    channel: Arc<dyn ServerChannel>,
}

impl RemoteProxyController {
    pub fn new(host: &str, server: &str, channel: Arc<dyn ServerChannel>) -> Self {
        Self {
            address: ProxyAddress {
                host: host.to_string(),
                server: server.to_string(),
            },
            channel,
        }
    }

    pub fn address(&self) -> &ProxyAddress {
        &self.address
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn execute(&self, operation: ManagementOperation) -> Result<(), ChannelError> {
        self.channel.send(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_operation_carries_permit() {
        let op = ManagementOperation::reload(42, Some(OperationId(7)));
        assert_eq!(op.operation, "reload");
        assert_eq!(op.parameters["permit"], 42);
        assert_eq!(op.operation_id, Some(OperationId(7)));
    }

    #[test]
    fn test_proxy_address_display() {
        let address = ProxyAddress {
            host: "host-a".into(),
            server: "server-one".into(),
        };
        assert_eq!(address.to_string(), "host=host-a/server=server-one");
    }
}
