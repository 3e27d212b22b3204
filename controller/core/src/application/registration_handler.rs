// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Master-side handling of slave registration
//!
//! One [`RegistrationSession`] per accepted slave connection. The session
//! answers requests in order and records the host's registration history.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::domain_controller::LocalDomainController;
use crate::domain::domain_controller::DomainController;
use crate::domain::host_registrations::{HostConnectionEvent, HostConnectionEventType, HostPinger};
use crate::domain::registration::{
    DomainRequest, DomainResponse, HostInfo, SlaveRegistrationErrorCode, REGISTRATION_OUTCOME_OK,
};

#[derive(Clone)]
pub struct HostRegistrationHandler {
    domain_controller: Arc<LocalDomainController>,
}

impl HostRegistrationHandler {
    pub fn new(domain_controller: Arc<LocalDomainController>) -> Self {
        Self { domain_controller }
    }

    pub fn session(&self, peer: SocketAddr, pinger: Arc<dyn HostPinger>) -> RegistrationSession {
        RegistrationSession {
            domain_controller: self.domain_controller.clone(),
            peer,
            pinger,
            state: SessionState::Idle,
        }
    }
}

enum SessionState {
    Idle,
    Pending(HostInfo),
    Registered(String),
    Closed,
}

pub struct RegistrationSession {
    domain_controller: Arc<LocalDomainController>,
    peer: SocketAddr,
    pinger: Arc<dyn HostPinger>,
    state: SessionState,
}

impl RegistrationSession {
    /// Name of the host registered through this session, if any.
    pub fn host_name(&self) -> Option<&str> {
        match &self.state {
            SessionState::Registered(host_name) => Some(host_name),
            SessionState::Pending(host_info) => Some(&host_info.host_name),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    pub fn handle(&mut self, request: DomainRequest) -> DomainResponse {
        match request {
            DomainRequest::RegisterHostController { host_id, host_info } => self.register(host_id, host_info),
            DomainRequest::CompleteRegistration { outcome, message } => self.complete(outcome, message),
            DomainRequest::UnregisterHostController { host_id } => self.unregister(&host_id),
            DomainRequest::Ping => DomainResponse::Pong,
        }
    }

    /// The slave's connection went away.
    pub fn connection_closed(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Registered(host_name) = state {
            warn!(host_name = %host_name, peer = %self.peer, "Lost connection to slave host");
            self.domain_controller.unregister_remote_host(
                &host_name,
                HostConnectionEvent::now(HostConnectionEventType::ConnectionLost),
            );
        }
    }

    fn register(&mut self, host_id: String, host_info: HostInfo) -> DomainResponse {
        if !matches!(self.state, SessionState::Idle) {
            return DomainResponse::RegistrationFailed {
                code: SlaveRegistrationErrorCode::Unknown,
                message: "registration already in progress on this connection".to_string(),
            };
        }

        if let Err(e) = self.domain_controller.check_registration_allowed(&host_id) {
            warn!(host_name = %host_id, peer = %self.peer, error = %e, "Refusing slave registration");
            self.domain_controller.registration_failed(&host_id, e.to_string());
            return DomainResponse::RegistrationFailed {
                code: e.registration_code(),
                message: e.to_string(),
            };
        }

        info!(
            host_name = %host_id,
            peer = %self.peer,
            version = %host_info.product_version,
            "Slave host registering"
        );
        let host_info = HostInfo {
            host_name: host_id,
            ..host_info
        };
        self.state = SessionState::Pending(host_info);
        DomainResponse::DomainModel {
            model: self.domain_controller.domain_model(),
        }
    }

    fn complete(&mut self, outcome: u8, message: String) -> DomainResponse {
        let state = std::mem::replace(&mut self.state, SessionState::Idle);
        let SessionState::Pending(host_info) = state else {
            self.state = state;
            return DomainResponse::RegistrationFailed {
                code: SlaveRegistrationErrorCode::Unknown,
                message: "no registration in progress".to_string(),
            };
        };
        let host_name = host_info.host_name.clone();

        if outcome != REGISTRATION_OUTCOME_OK {
            warn!(host_name = %host_name, message = %message, "Slave failed to apply domain model");
            self.domain_controller.registration_failed(&host_name, message);
            return DomainResponse::Ack;
        }

        match self
            .domain_controller
            .register_remote_host(host_info, self.pinger.clone(), self.peer)
        {
            Ok(()) => {
                self.state = SessionState::Registered(host_name);
                DomainResponse::Ack
            }
            Err(e) => {
                self.domain_controller.registration_failed(&host_name, e.to_string());
                DomainResponse::RegistrationFailed {
                    code: e.registration_code(),
                    message: e.to_string(),
                }
            }
        }
    }

    fn unregister(&mut self, host_id: &str) -> DomainResponse {
        match &self.state {
            SessionState::Registered(host_name) if host_name == host_id => {
                self.domain_controller.unregister_remote_host(
                    host_id,
                    HostConnectionEvent::now(HostConnectionEventType::Unregistered),
                );
                self.state = SessionState::Closed;
            }
            _ => debug!(host_name = %host_id, "Unregister for host not registered on this connection"),
        }
        DomainResponse::Ack
    }
}
