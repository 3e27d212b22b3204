// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Slave/master registration protocol
//!
//! Message types exchanged on a domain channel and the transport traits the
//! registration client is written against. Every request gets exactly one
//! response on the same channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::domain_model::DomainModel;

/// Outcome byte of a successful local model application.
pub const REGISTRATION_OUTCOME_OK: u8 = 0;
/// Outcome byte of a failed local model application.
pub const REGISTRATION_OUTCOME_FAILED: u8 = 1;

/// Identity and capabilities a slave presents when registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_name: String,
    pub product_name: String,
    pub product_version: String,
    pub management_major_version: u32,
    pub management_minor_version: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HostInfo {
    pub fn local(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            product_name: "hostctl".to_string(),
            product_version: env!("CARGO_PKG_VERSION").to_string(),
            management_major_version: 1,
            management_minor_version: 0,
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaveRegistrationErrorCode {
    HostIsNotMaster,
    MasterIsAdminOnly,
    HostAlreadyExists,
    Unknown,
}

impl fmt::Display for SlaveRegistrationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlaveRegistrationErrorCode::HostIsNotMaster => "HOST_IS_NOT_MASTER",
            SlaveRegistrationErrorCode::MasterIsAdminOnly => "MASTER_IS_ADMIN_ONLY",
            SlaveRegistrationErrorCode::HostAlreadyExists => "HOST_ALREADY_EXISTS",
            SlaveRegistrationErrorCode::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A registration refused by the master.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct SlaveRegistrationError {
    pub code: SlaveRegistrationErrorCode,
    pub message: String,
}

impl SlaveRegistrationError {
    pub fn new(code: SlaveRegistrationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainRequest {
    RegisterHostController { host_id: String, host_info: HostInfo },
    CompleteRegistration { outcome: u8, message: String },
    UnregisterHostController { host_id: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainResponse {
    DomainModel { model: DomainModel },
    RegistrationFailed { code: SlaveRegistrationErrorCode, message: String },
    Ack,
    Pong,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Opens connections to a master.
#[async_trait]
pub trait DomainConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn DomainConnection>, TransportError>;
}

#[async_trait]
pub trait DomainConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn DomainChannel>, TransportError>;

    /// Resolves once the connection has closed.
    async fn closed(&self);

    fn close(&self);
}

#[async_trait]
pub trait DomainChannel: Send + Sync {
    async fn request(&self, request: DomainRequest) -> Result<DomainResponse, TransportError>;

    /// Resolves once the channel has closed.
    async fn closed(&self);

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = DomainRequest::UnregisterHostController {
            host_id: "host-b".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "unregister_host_controller");
        assert_eq!(json["host_id"], "host-b");
    }

    #[test]
    fn test_registration_error_display() {
        let err = SlaveRegistrationError::new(SlaveRegistrationErrorCode::HostAlreadyExists, "host-b");
        assert_eq!(err.to_string(), "HOST_ALREADY_EXISTS: host-b");
    }
}
