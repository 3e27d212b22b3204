// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Master-side bookkeeping of slave host connections
//!
//! Each slave host that ever talked to this master has an entry with a
//! bounded event history. Connected entries hold the liveness pinger and
//! peer address; disconnected entries hold neither.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// How long host connection events are kept.
pub fn event_retention() -> Duration {
    Duration::days(7)
}

/// Liveness monitor attached to a connected slave.
pub trait HostPinger: Send + Sync + fmt::Debug {
    fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostConnectionEventType {
    Registered,
    RegistrationFailed,
    Unregistered,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConnectionEvent {
    pub event_type: HostConnectionEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HostConnectionEvent {
    pub fn new(event_type: HostConnectionEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            timestamp,
            message: None,
        }
    }

    pub fn now(event_type: HostConnectionEventType) -> Self {
        Self::new(event_type, Utc::now())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone)]
struct LiveConnection {
    pinger: Arc<dyn HostPinger>,
    address: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct DomainHostConnection {
    host_name: String,
    live: Option<LiveConnection>,
    events: Vec<HostConnectionEvent>,
}

impl DomainHostConnection {
    fn connected(
        host_name: &str,
        pinger: Arc<dyn HostPinger>,
        address: SocketAddr,
        events: Vec<HostConnectionEvent>,
    ) -> Self {
        Self {
            host_name: host_name.to_string(),
            live: Some(LiveConnection { pinger, address }),
            events,
        }
    }

    fn disconnected(host_name: &str, events: Vec<HostConnectionEvent>) -> Self {
        Self {
            host_name: host_name.to_string(),
            live: None,
            events,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn is_connected(&self) -> bool {
        self.live.is_some()
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.live.as_ref().map(|l| l.address)
    }

    pub fn pinger(&self) -> Option<&Arc<dyn HostPinger>> {
        self.live.as_ref().map(|l| &l.pinger)
    }

    pub fn events(&self) -> &[HostConnectionEvent] {
        &self.events
    }
}

/// Serializable view of one registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRegistrationSummary {
    pub host_name: String,
    pub connected: bool,
    pub address: Option<SocketAddr>,
    pub events: Vec<HostConnectionEvent>,
}

impl From<&DomainHostConnection> for HostRegistrationSummary {
    fn from(connection: &DomainHostConnection) -> Self {
        Self {
            host_name: connection.host_name.clone(),
            connected: connection.is_connected(),
            address: connection.address(),
            events: connection.events.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DomainSlaveHostRegistrations {
    hosts: Mutex<HashMap<String, DomainHostConnection>>,
}

impl DomainSlaveHostRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connected host, keeping the history of any previous entry.
    pub fn register_host(&self, host_name: &str, pinger: Arc<dyn HostPinger>, address: SocketAddr) {
        let mut hosts = self.hosts.lock();
        let mut events = hosts
            .remove(host_name)
            .map(|previous| previous.events)
            .unwrap_or_default();
        events.push(HostConnectionEvent::now(HostConnectionEventType::Registered));
        hosts.insert(
            host_name.to_string(),
            DomainHostConnection::connected(host_name, pinger, address, events),
        );
    }

    /// Mark a host disconnected. Returns false when the host is unknown.
    pub fn unregister_host(&self, host_name: &str, event: HostConnectionEvent) -> bool {
        let mut hosts = self.hosts.lock();
        let Some(previous) = hosts.remove(host_name) else {
            return false;
        };
        let mut events = previous.events;
        events.push(event);
        hosts.insert(
            host_name.to_string(),
            DomainHostConnection::disconnected(host_name, events),
        );
        true
    }

    pub fn add_event(&self, host_name: &str, event: HostConnectionEvent) {
        let mut hosts = self.hosts.lock();
        hosts
            .entry(host_name.to_string())
            .or_insert_with(|| DomainHostConnection::disconnected(host_name, Vec::new()))
            .events
            .push(event);
    }

    pub fn get_registration(&self, host_name: &str) -> Option<DomainHostConnection> {
        self.hosts.lock().get(host_name).cloned()
    }

    pub fn is_connected(&self, host_name: &str) -> bool {
        self.hosts
            .lock()
            .get(host_name)
            .map(DomainHostConnection::is_connected)
            .unwrap_or(false)
    }

    pub fn summaries(&self) -> Vec<HostRegistrationSummary> {
        let hosts = self.hosts.lock();
        let mut summaries: Vec<HostRegistrationSummary> =
            hosts.values().map(HostRegistrationSummary::from).collect();
        summaries.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        summaries
    }

    pub fn connected_count(&self) -> usize {
        self.hosts.lock().values().filter(|h| h.is_connected()).count()
    }

    pub fn prune_expired(&self) {
        self.prune_expired_at(Utc::now());
    }

    /// Drop events older than the retention window as of `now`, then drop
    /// disconnected hosts with no events left.
    pub fn prune_expired_at(&self, now: DateTime<Utc>) {
        let cutoff = now - event_retention();
        let mut hosts = self.hosts.lock();
        hosts.retain(|_, host| {
            host.events.retain(|event| event.timestamp >= cutoff);
            host.is_connected() || !host.events.is_empty()
        });
    }

    pub fn prune_disconnected(&self) {
        self.hosts.lock().retain(|_, host| host.is_connected());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct NoopPinger;

    impl HostPinger for NoopPinger {
        fn cancel(&self) {}
    }

    fn addr() -> SocketAddr {
        "10.0.0.2:9999".parse().unwrap()
    }

    #[test]
    fn test_register_host_adds_registered_event() {
        let registrations = DomainSlaveHostRegistrations::new();
        registrations.register_host("host-b", Arc::new(NoopPinger), addr());

        let registration = registrations.get_registration("host-b").unwrap();
        assert!(registration.is_connected());
        assert_eq!(registration.address(), Some(addr()));
        assert!(registration.pinger().is_some());
        assert_eq!(registration.events().len(), 1);
        assert_eq!(
            registration.events()[0].event_type,
            HostConnectionEventType::Registered
        );

        registrations.unregister_host(
            "host-b",
            HostConnectionEvent::now(HostConnectionEventType::Unregistered),
        );
        registrations.register_host("host-b", Arc::new(NoopPinger), addr());
        let registration = registrations.get_registration("host-b").unwrap();
        assert_eq!(registration.events().len(), 3);
        assert_eq!(
            registration.events().last().unwrap().event_type,
            HostConnectionEventType::Registered
        );
    }

    #[test]
    fn test_unregister_unknown_host() {
        let registrations = DomainSlaveHostRegistrations::new();
        assert!(!registrations.unregister_host(
            "ghost",
            HostConnectionEvent::now(HostConnectionEventType::Unregistered)
        ));
        assert!(registrations.get_registration("ghost").is_none());
    }

    #[test]
    fn test_unregister_drops_pinger_and_address() {
        let registrations = DomainSlaveHostRegistrations::new();
        registrations.register_host("host-b", Arc::new(NoopPinger), addr());
        assert!(registrations.unregister_host(
            "host-b",
            HostConnectionEvent::now(HostConnectionEventType::ConnectionLost)
        ));

        let registration = registrations.get_registration("host-b").unwrap();
        assert!(!registration.is_connected());
        assert!(registration.address().is_none());
        assert!(registration.pinger().is_none());
        assert_eq!(registration.events().len(), 2);
    }

    #[test]
    fn test_add_event_synthesizes_entry() {
        let registrations = DomainSlaveHostRegistrations::new();
        registrations.add_event(
            "host-c",
            HostConnectionEvent::now(HostConnectionEventType::RegistrationFailed).with_message("duplicate"),
        );

        let registration = registrations.get_registration("host-c").unwrap();
        assert!(!registration.is_connected());
        assert_eq!(registration.events().len(), 1);
        assert_eq!(registration.events()[0].message.as_deref(), Some("duplicate"));
    }

    #[test]
    fn test_prune_expired() {
        let registrations = DomainSlaveHostRegistrations::new();
        let old = Utc::now() - Duration::days(8);

        registrations.add_event("stale", HostConnectionEvent::new(HostConnectionEventType::Registered, old));
        registrations.add_event("stale", HostConnectionEvent::new(HostConnectionEventType::Unregistered, old));

        registrations.add_event("recent", HostConnectionEvent::new(HostConnectionEventType::Registered, old));
        registrations.add_event("recent", HostConnectionEvent::now(HostConnectionEventType::Unregistered));

        registrations.prune_expired();

        assert!(registrations.get_registration("stale").is_none());
        let recent = registrations.get_registration("recent").unwrap();
        assert_eq!(recent.events().len(), 1);
    }

    #[test]
    fn test_prune_expired_keeps_connected_hosts() {
        let registrations = DomainSlaveHostRegistrations::new();
        registrations.register_host("host-b", Arc::new(NoopPinger), addr());
        registrations.unregister_host("host-b", HostConnectionEvent::now(HostConnectionEventType::Unregistered));
        registrations.register_host("host-b", Arc::new(NoopPinger), addr());

        // every event is past the window as seen from the future
        registrations.prune_expired_at(Utc::now() + Duration::days(30));

        let registration = registrations.get_registration("host-b").unwrap();
        assert!(registration.is_connected());
        assert!(registration.events().is_empty());
    }

    #[test]
    fn test_prune_disconnected() {
        let registrations = DomainSlaveHostRegistrations::new();
        registrations.register_host("host-b", Arc::new(NoopPinger), addr());
        registrations.register_host("host-c", Arc::new(NoopPinger), addr());
        registrations.unregister_host("host-c", HostConnectionEvent::now(HostConnectionEventType::Unregistered));

        registrations.prune_disconnected();

        assert!(registrations.get_registration("host-b").is_some());
        assert!(registrations.get_registration("host-c").is_none());
        assert_eq!(registrations.connected_count(), 1);
    }
}
