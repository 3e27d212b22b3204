// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Pub/Sub for host controller events
//
// In-memory fan-out over a tokio broadcast channel. Server state machines
// report through the ServerLifecycleObserver impl; the domain connection and
// the master-side registration handler publish connection events directly.
// Slow subscribers lose the oldest events.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{DomainConnectionEvent, ServerLifecycleEvent};
use crate::domain::managed_server::{ServerLifecycleObserver, ServerStateSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    ServerLifecycle(ServerLifecycleEvent),
    DomainConnection(DomainConnectionEvent),
}

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<HostEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered before the oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_server_event(&self, event: ServerLifecycleEvent) {
        self.publish(HostEvent::ServerLifecycle(event));
    }

    pub fn publish_connection_event(&self, event: DomainConnectionEvent) {
        self.publish(HostEvent::DomainConnection(event));
    }

    fn publish(&self, event: HostEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to lifecycle events of a single server.
    pub fn subscribe_server(&self, server_name: impl Into<String>) -> ServerEventReceiver {
        ServerEventReceiver {
            receiver: self.sender.subscribe(),
            server_name: server_name.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl ServerLifecycleObserver for EventBus {
    fn state_changed(&self, server_name: &str, snapshot: ServerStateSnapshot) {
        self.publish_server_event(ServerLifecycleEvent::StateChanged {
            server_name: server_name.to_string(),
            required: snapshot.required,
            internal: snapshot.internal,
            status: snapshot.status(),
            changed_at: Utc::now(),
        });
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<HostEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<HostEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<HostEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one server's lifecycle events.
pub struct ServerEventReceiver {
    receiver: broadcast::Receiver<HostEvent>,
    server_name: String,
}

impl ServerEventReceiver {
    pub async fn recv(&mut self) -> Result<ServerLifecycleEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let HostEvent::ServerLifecycle(event) = event {
                if event_server_name(&event) == self.server_name {
                    return Ok(event);
                }
            }
        }
    }
}

fn event_server_name(event: &ServerLifecycleEvent) -> &str {
    match event {
        ServerLifecycleEvent::StateChanged { server_name, .. }
        | ServerLifecycleEvent::ServerRegistered { server_name, .. }
        | ServerLifecycleEvent::ServerUnregistered { server_name, .. } => server_name,
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
