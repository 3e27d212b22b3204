// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Managed Server - lifecycle state machine for one server process
//
// The required state is set by the inventory; the internal state moves one
// step at a time toward it. Each step may run a transition task (a request to
// the process controller or the server's back-channel). Tasks only enqueue
// requests, so the per-server lock is never held across a wait for a reply.
//
// While the internal state is asynchronous the driver waits for the matching
// notification (process added/started/stopped/removed, channel registered,
// server started). Notifications compare-and-set from the expected async
// state, so late or out-of-order deliveries are ignored.

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::auth::AuthKey;
use crate::domain::boot::{
    BootConfigurationError, ManagedServerBootConfiguration, OperationId, OperationIdCounter,
    ServerBootPayload,
};
use crate::domain::channel::{ChannelError, ChannelId, ManagementOperation, ServerChannel};
use crate::domain::process::{server_process_name, ProcessControllerClient, ProcessControllerError};
use crate::domain::server_state::{
    failure_fallback, next_state, server_status, InternalState, RequiredState, ServerStatus,
};

/// Required and internal state at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStateSnapshot {
    pub required: RequiredState,
    pub internal: InternalState,
}

impl ServerStateSnapshot {
    pub fn status(&self) -> ServerStatus {
        server_status(self.required, self.internal)
    }
}

/// Receives every state mutation of every server it is attached to.
///
/// Called with the server lock held; implementations must not block.
pub trait ServerLifecycleObserver: Send + Sync {
    fn state_changed(&self, server_name: &str, snapshot: ServerStateSnapshot);
}

#[derive(Debug, Error)]
pub enum ManagedServerError {
    #[error("server '{server}' cannot start while {internal} (required {required})")]
    TransitionInProgress {
        server: String,
        required: RequiredState,
        internal: InternalState,
    },

    #[error(transparent)]
    BootConfiguration(#[from] BootConfigurationError),
}

/// Failure raised by a transition task. Never leaves the state machine.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    ProcessController(#[from] ProcessControllerError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("no management channel registered")]
    NoChannel,

    #[error("no boot configuration captured")]
    NoBootConfiguration,

    #[error("failed to encode boot payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Work performed while moving into a new internal state.
#[derive(Debug)]
enum TransitionTask {
    ProcessAdd,
    ProcessStart,
    SendStdin,
    ServerStarted,
    ServerStop,
    ProcessRemove,
    Reconnect,
    ChannelRegistered {
        channel: Arc<dyn ServerChannel>,
        reloaded: bool,
    },
    Reload {
        permit: u32,
    },
}

impl TransitionTask {
    /// Task run by the driver when it moves into `target`.
    fn for_target(target: InternalState) -> Option<Self> {
        match target {
            InternalState::ProcessAdding => Some(TransitionTask::ProcessAdd),
            InternalState::ProcessStarting => Some(TransitionTask::ProcessStart),
            InternalState::SendStdin => Some(TransitionTask::SendStdin),
            InternalState::ServerStarted => Some(TransitionTask::ServerStarted),
            InternalState::ProcessStopping => Some(TransitionTask::ServerStop),
            InternalState::ProcessRemoving => Some(TransitionTask::ProcessRemove),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TransitionTask::ProcessAdd => "process_add",
            TransitionTask::ProcessStart => "process_start",
            TransitionTask::SendStdin => "send_stdin",
            TransitionTask::ServerStarted => "server_started",
            TransitionTask::ServerStop => "server_stop",
            TransitionTask::ProcessRemove => "process_remove",
            TransitionTask::Reconnect => "reconnect",
            TransitionTask::ChannelRegistered { .. } => "channel_registered",
            TransitionTask::Reload { .. } => "reload",
        }
    }
}

#[derive(Debug)]
struct ServerInner {
    required: RequiredState,
    internal: InternalState,
    boot_configuration: Option<Arc<ManagedServerBootConfiguration>>,
    operation_id: Option<OperationId>,
    requires_reload: bool,
    channel: Option<Arc<dyn ServerChannel>>,
    /// Teardown step that left the server in internal `FAILED`.
    failed_teardown: Option<InternalState>,
}

impl ServerInner {
    fn snapshot(&self) -> ServerStateSnapshot {
        ServerStateSnapshot {
            required: self.required,
            internal: self.internal,
        }
    }
}

pub struct ManagedServer {
    server_name: String,
    process_name: String,
    host_name: String,
    auth_key: AuthKey,
    management_address: SocketAddr,
    process_controller: Arc<dyn ProcessControllerClient>,
    operation_ids: Arc<OperationIdCounter>,
    observer: Option<Arc<dyn ServerLifecycleObserver>>,
    inner: Mutex<ServerInner>,
    state_tx: watch::Sender<ServerStateSnapshot>,
}

impl ManagedServer {
    pub fn new(
        server_name: impl Into<String>,
        host_name: impl Into<String>,
        auth_key: AuthKey,
        management_address: SocketAddr,
        process_controller: Arc<dyn ProcessControllerClient>,
        operation_ids: Arc<OperationIdCounter>,
    ) -> Self {
        let server_name = server_name.into();
        let inner = ServerInner {
            required: RequiredState::Stopped,
            internal: InternalState::Stopped,
            boot_configuration: None,
            operation_id: None,
            requires_reload: false,
            channel: None,
            failed_teardown: None,
        };
        let (state_tx, _) = watch::channel(inner.snapshot());

        Self {
            process_name: server_process_name(&server_name),
            server_name,
            host_name: host_name.into(),
            auth_key,
            management_address,
            process_controller,
            operation_ids,
            observer: None,
            inner: Mutex::new(inner),
            state_tx,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ServerLifecycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    pub fn state(&self) -> ServerStateSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn status(&self) -> ServerStatus {
        self.state().status()
    }

    pub fn internal_state(&self) -> InternalState {
        self.inner.lock().internal
    }

    pub fn required_state(&self) -> RequiredState {
        self.inner.lock().required
    }

    pub fn operation_id(&self) -> Option<OperationId> {
        self.inner.lock().operation_id
    }

    pub fn boot_configuration(&self) -> Option<Arc<ManagedServerBootConfiguration>> {
        self.inner.lock().boot_configuration.clone()
    }

    pub fn is_requires_reload(&self) -> bool {
        self.inner.lock().requires_reload
    }

    /// Ask for a full reload the next time the server reconnects.
    pub fn require_reload(&self) {
        self.inner.lock().requires_reload = true;
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.inner.lock().channel.as_ref().map(|c| c.id())
    }

    /// Request the server be started.
    ///
    /// `create_configuration` is only called when a start actually begins.
    pub fn start<F>(&self, create_configuration: F) -> Result<(), ManagedServerError>
    where
        F: FnOnce() -> Result<ManagedServerBootConfiguration, BootConfigurationError>,
    {
        let mut inner = self.inner.lock();
        if inner.required == RequiredState::ServerStarted {
            debug!(server_name = %self.server_name, "start ignored, server already required started");
            return Ok(());
        }
        if inner.required == RequiredState::Stopped && inner.internal != InternalState::Stopped {
            return Err(ManagedServerError::TransitionInProgress {
                server: self.server_name.clone(),
                required: inner.required,
                internal: inner.internal,
            });
        }

        let boot_configuration = create_configuration()?;
        let operation_id = self.operation_ids.next();
        inner.operation_id = Some(operation_id);
        inner.boot_configuration = Some(Arc::new(boot_configuration));
        inner.required = RequiredState::ServerStarted;
        info!(
            server_name = %self.server_name,
            operation_id = %operation_id,
            state = %inner.internal,
            "Starting server"
        );
        self.publish(&inner);
        if inner.internal == InternalState::Failed {
            // the process may still be registered, finish tearing it down first
            self.retry_teardown(&mut inner);
        } else {
            self.drive(&mut inner, false);
        }
        Ok(())
    }

    /// Request the server be stopped. Returns without waiting.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.required == RequiredState::Stopped {
            return;
        }
        inner.required = RequiredState::Stopped;
        info!(server_name = %self.server_name, state = %inner.internal, "Stopping server");
        self.publish(&inner);
        if inner.internal == InternalState::Failed {
            self.retry_teardown(&mut inner);
        } else {
            self.drive(&mut inner, true);
        }
    }

    /// Reload a started server. Returns false when it is not started.
    pub fn reload(&self, permit: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.internal != InternalState::ServerStarted {
            return false;
        }
        self.internal_set_state(
            &mut inner,
            Some(TransitionTask::Reload { permit }),
            InternalState::ServerStarted,
            InternalState::Reloading,
        )
    }

    /// Re-attach to a process that survived a host controller restart.
    pub fn reconnect_server_process(&self, boot_configuration: ManagedServerBootConfiguration) {
        let mut inner = self.inner.lock();
        if inner.required == RequiredState::ServerStarted {
            return;
        }
        inner.boot_configuration = Some(Arc::new(boot_configuration));
        inner.required = RequiredState::ServerStarted;
        self.publish(&inner);
        self.internal_set_state(
            &mut inner,
            Some(TransitionTask::Reconnect),
            InternalState::Stopped,
            InternalState::SendStdin,
        );
    }

    /// Clean up a process the process controller knows but is not running.
    pub fn remove_server_process(&self) {
        let mut inner = self.inner.lock();
        inner.required = RequiredState::Stopped;
        self.publish(&inner);
        self.internal_set_state(
            &mut inner,
            Some(TransitionTask::ProcessRemove),
            InternalState::Stopped,
            InternalState::ProcessRemoving,
        );
    }

    /// Track a process that is already on its way down.
    pub fn set_server_process_stopping(&self) {
        let mut inner = self.inner.lock();
        inner.required = RequiredState::Stopped;
        self.publish(&inner);
        self.internal_set_state(
            &mut inner,
            None,
            InternalState::Stopped,
            InternalState::ProcessStopping,
        );
    }

    /// Run the driver once.
    pub fn transition(&self) {
        let mut inner = self.inner.lock();
        self.drive(&mut inner, false);
    }

    pub fn process_added(&self) {
        self.finish_transition(InternalState::ProcessAdding, InternalState::ProcessAdded);
    }

    pub fn process_started(&self) {
        self.finish_transition(InternalState::ProcessStarting, InternalState::ProcessStarted);
    }

    pub fn process_removed(&self) {
        self.finish_transition(InternalState::ProcessRemoving, InternalState::Stopped);
    }

    /// The OS process exited.
    pub fn process_finished(&self) {
        let mut inner = self.inner.lock();
        if inner.internal == InternalState::ProcessStopping {
            if self.internal_set_state(
                &mut inner,
                None,
                InternalState::ProcessStopping,
                InternalState::ProcessStopped,
            ) {
                self.drive(&mut inner, false);
            }
            return;
        }

        inner.channel = None;
        if inner.required == RequiredState::Stopped {
            inner.internal = InternalState::ProcessStopped;
            self.publish(&inner);
            self.drive(&mut inner, false);
            return;
        }

        warn!(
            server_name = %self.server_name,
            state = %inner.internal,
            "Server process exited unexpectedly"
        );
        inner.required = RequiredState::Failed;
        inner.internal = InternalState::ProcessStopped;
        self.publish(&inner);
    }

    /// The server's back-channel connected. Returns whether it was accepted.
    pub fn channel_registered(&self, channel: Arc<dyn ServerChannel>) -> bool {
        let mut inner = self.inner.lock();
        let registered = if inner.internal == InternalState::Reloading {
            self.internal_set_state(
                &mut inner,
                Some(TransitionTask::ChannelRegistered {
                    channel,
                    reloaded: true,
                }),
                InternalState::Reloading,
                InternalState::ServerStarting,
            )
        } else {
            self.internal_set_state(
                &mut inner,
                Some(TransitionTask::ChannelRegistered {
                    channel,
                    reloaded: false,
                }),
                InternalState::SendStdin,
                InternalState::ServerStarting,
            )
        };

        if registered {
            let force = inner.required == RequiredState::Stopped;
            self.drive(&mut inner, force);
        }
        registered
    }

    /// The server reported that it finished booting.
    ///
    /// `None` is used by reconnecting servers, which have no boot to match.
    pub fn server_started(&self, operation_id: Option<OperationId>) {
        let mut inner = self.inner.lock();
        if let (Some(reported), Some(expected)) = (operation_id, inner.operation_id) {
            if reported != expected {
                warn!(
                    server_name = %self.server_name,
                    reported = %reported,
                    expected = %expected,
                    "Ignoring start report for a previous boot"
                );
                return;
            }
        }
        if self.internal_set_state(
            &mut inner,
            Some(TransitionTask::ServerStarted),
            InternalState::ServerStarting,
            InternalState::ServerStarted,
        ) {
            self.drive(&mut inner, false);
        }
    }

    pub fn server_start_failed(&self) {
        self.transition_failed(InternalState::ServerStarting);
    }

    /// An async operation that was in flight for `state` failed.
    pub fn transition_failed(&self, state: InternalState) {
        let mut inner = self.inner.lock();
        if inner.internal == state {
            self.fail_in(&mut inner, state);
        }
    }

    /// The back-channel identified by `channel_id` closed.
    ///
    /// Returns true for an expected teardown, false when a reconnect was
    /// initiated.
    pub fn callback_unregistered(&self, channel_id: ChannelId, shutting_down: bool) -> bool {
        let mut inner = self.inner.lock();
        match &inner.channel {
            Some(current) if current.id() == channel_id => inner.channel = None,
            _ => {
                debug!(server_name = %self.server_name, channel = %channel_id, "Stale channel closed");
                return true;
            }
        }

        if shutting_down || inner.required != RequiredState::ServerStarted {
            return true;
        }

        let state = inner.internal;
        match state {
            InternalState::ServerStarting | InternalState::ServerStarted => {
                warn!(
                    server_name = %self.server_name,
                    state = %state,
                    "Management channel lost, reconnecting server"
                );
                self.internal_set_state(
                    &mut inner,
                    Some(TransitionTask::Reconnect),
                    state,
                    InternalState::SendStdin,
                );
                false
            }
            _ => true,
        }
    }

    /// Wait until the internal state equals `expected`.
    ///
    /// Returns false as soon as the required state moves away from its value
    /// at call time or becomes `FAILED`.
    pub async fn await_state(&self, expected: InternalState) -> bool {
        let mut rx = self.state_tx.subscribe();
        let initial = rx.borrow_and_update().required;

        loop {
            {
                let snapshot = *rx.borrow_and_update();
                if snapshot.internal == expected {
                    return true;
                }
                if snapshot.required != initial || snapshot.required == RequiredState::Failed {
                    return false;
                }
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStateSnapshot> {
        self.state_tx.subscribe()
    }

    fn finish_transition(&self, current: InternalState, next: InternalState) {
        let mut inner = self.inner.lock();
        if self.internal_set_state(&mut inner, None, current, next) {
            self.drive(&mut inner, false);
        }
    }

    /// Step toward the required state until an async state is reached.
    ///
    /// `force` lets the first step leave an async state when the step has a
    /// task of its own, which is how a stop overtakes an in-flight start.
    fn drive(&self, inner: &mut ServerInner, force: bool) {
        let mut force = force;
        loop {
            let current = inner.internal;
            let Some(next) = next_state(current, inner.required) else {
                return;
            };
            let task = TransitionTask::for_target(next);
            if current.is_async() && !(force && task.is_some()) {
                return;
            }
            force = false;
            if !self.internal_set_state(inner, task, current, next) {
                return;
            }
        }
    }

    /// Compare-and-set of the internal state, running `task` first.
    fn internal_set_state(
        &self,
        inner: &mut ServerInner,
        task: Option<TransitionTask>,
        current: InternalState,
        next: InternalState,
    ) -> bool {
        if inner.internal != current {
            debug!(
                server_name = %self.server_name,
                expected = %current,
                actual = %inner.internal,
                "Ignoring transition from a stale state"
            );
            return false;
        }

        if let Some(task) = task {
            let task_name = task.name();
            if let Err(error) = self.execute(task, inner) {
                warn!(
                    server_name = %self.server_name,
                    task = task_name,
                    state = %current,
                    error = %error,
                    "Transition task failed"
                );
                self.fail_in(inner, current);
                return false;
            }
        }

        debug!(
            server_name = %self.server_name,
            from = %current,
            to = %next,
            required = %inner.required,
            "Server state changed"
        );
        inner.internal = next;
        self.publish(inner);
        true
    }

    /// Leave internal `FAILED` by re-issuing the stop or remove that failed.
    ///
    /// The driver picks up from the notification that completes it.
    fn retry_teardown(&self, inner: &mut ServerInner) {
        let (task, next) = match inner.failed_teardown {
            Some(InternalState::ProcessRemoving) => (TransitionTask::ProcessRemove, InternalState::ProcessRemoving),
            _ => (TransitionTask::ServerStop, InternalState::ProcessStopping),
        };
        info!(
            server_name = %self.server_name,
            retry = %next,
            required = %inner.required,
            "Retrying failed process teardown"
        );
        self.internal_set_state(inner, Some(task), InternalState::Failed, next);
    }

    fn fail_in(&self, inner: &mut ServerInner, state: InternalState) {
        let fallback = failure_fallback(state);
        if fallback == InternalState::Failed && state != InternalState::Failed {
            inner.failed_teardown = Some(state);
        }
        counter!("hostctl_server_transition_failures_total").increment(1);
        warn!(
            server_name = %self.server_name,
            state = %state,
            fallback = %fallback,
            "Server transition failed"
        );
        inner.internal = fallback;
        inner.required = RequiredState::Failed;
        self.publish(inner);
    }

    fn execute(&self, task: TransitionTask, inner: &mut ServerInner) -> Result<(), TaskError> {
        match task {
            TransitionTask::ProcessAdd => {
                let config = inner
                    .boot_configuration
                    .clone()
                    .ok_or(TaskError::NoBootConfiguration)?;
                self.process_controller.add_process(
                    &self.process_name,
                    &self.auth_key,
                    &config.launch_command,
                    &config.environment,
                    &config.working_directory,
                )?;
            }
            TransitionTask::ProcessStart => {
                self.process_controller.start_process(&self.process_name)?;
            }
            TransitionTask::SendStdin => {
                let config = inner
                    .boot_configuration
                    .clone()
                    .ok_or(TaskError::NoBootConfiguration)?;
                let payload = ServerBootPayload {
                    host_name: self.host_name.clone(),
                    server_name: self.server_name.clone(),
                    management_address: self.management_address.to_string(),
                    auth_key: self.auth_key.to_base64(),
                    operation_id: inner.operation_id,
                    managed_subsystem_endpoint: config.managed_subsystem_endpoint,
                    subsystem_endpoint_configuration: config.subsystem_endpoint_configuration.clone(),
                    boot_operations: config.boot_operations.clone(),
                };
                let bytes = serde_json::to_vec(&payload)?;
                self.process_controller.send_stdin(&self.process_name, bytes)?;
            }
            TransitionTask::ServerStarted => {
                counter!("hostctl_servers_started_total").increment(1);
                info!(server_name = %self.server_name, "Server started");
            }
            TransitionTask::ServerStop => {
                inner.channel = None;
                self.process_controller.stop_process(&self.process_name)?;
            }
            TransitionTask::ProcessRemove => {
                self.process_controller.remove_process(&self.process_name)?;
            }
            TransitionTask::Reconnect => {
                let managed_endpoint = inner
                    .boot_configuration
                    .as_ref()
                    .map(|c| c.managed_subsystem_endpoint)
                    .unwrap_or(false);
                self.process_controller.reconnect_process(
                    &self.process_name,
                    self.management_address,
                    managed_endpoint,
                    &self.auth_key,
                )?;
            }
            TransitionTask::ChannelRegistered { channel, reloaded } => {
                debug!(server_name = %self.server_name, channel = %channel.id(), "Channel registered");
                inner.channel = Some(channel);
                if reloaded {
                    inner.requires_reload = false;
                }
            }
            TransitionTask::Reload { permit } => {
                let channel = inner.channel.as_ref().ok_or(TaskError::NoChannel)?;
                channel.send(ManagementOperation::reload(permit, inner.operation_id))?;
            }
        }
        Ok(())
    }

    fn publish(&self, inner: &ServerInner) {
        let snapshot = inner.snapshot();
        self.state_tx.send_replace(snapshot);
        if let Some(observer) = &self.observer {
            observer.state_changed(&self.server_name, snapshot);
        }
    }
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ManagedServer")
            .field("server_name", &self.server_name)
            .field("required", &inner.required)
            .field("internal", &inner.internal)
            .finish()
    }
}
