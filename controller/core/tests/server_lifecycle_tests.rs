// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use common::{domain_model, test_host, TestChannel};
use hostctl_core::domain::domain_controller::RunningMode;
use hostctl_core::domain::events::ServerLifecycleEvent;
use hostctl_core::domain::process::ProcessMessageHandler;
use hostctl_core::domain::server_state::{InternalState, RequiredState, ServerStatus};
use hostctl_core::infrastructure::event_bus::{EventReceiver, HostEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const PROCESS: &str = "Server:server-one";

fn drain_statuses(receiver: &mut EventReceiver, server: &str) -> Vec<ServerStatus> {
    let mut statuses: Vec<ServerStatus> = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let HostEvent::ServerLifecycle(ServerLifecycleEvent::StateChanged {
            server_name, status, ..
        }) = event
        {
            if server_name == server && statuses.last() != Some(&status) {
                statuses.push(status);
            }
        }
    }
    statuses
}

#[tokio::test]
async fn test_start_reports_stopped_starting_started() {
    let host = test_host("host-a", true, RunningMode::Normal);
    let mut events = host.event_bus.subscribe();

    host.inventory.start_server("server-one", &domain_model()).unwrap();
    host.inventory.handle_process_added(PROCESS);
    host.inventory.handle_process_started(PROCESS);

    let channel = TestChannel::new();
    assert!(host
        .inventory
        .server_communication_registered(PROCESS, channel.clone())
        .unwrap());
    let operation_id = host.inventory.get_server("server-one").unwrap().operation_id();
    host.inventory.server_started(PROCESS, operation_id);

    assert_eq!(host.inventory.determine_server_status("server-one"), ServerStatus::Started);
    assert_eq!(
        drain_statuses(&mut events, "server-one"),
        vec![ServerStatus::Stopped, ServerStatus::Starting, ServerStatus::Started]
    );
    assert!(host.domain_controller.running_server("server-one").is_some());
    assert_eq!(
        host.process_controller.calls(),
        vec![
            format!("add {PROCESS}"),
            format!("start {PROCESS}"),
            format!("send_stdin {PROCESS}"),
        ]
    );
}

#[tokio::test]
async fn test_out_of_order_notifications_are_ignored() {
    let host = test_host("host-a", true, RunningMode::Normal);
    host.inventory.start_server("server-one", &domain_model()).unwrap();

    // started before added: the CAS from PROCESS_STARTING fails
    host.inventory.handle_process_started(PROCESS);
    let server = host.inventory.get_server("server-one").unwrap();
    assert_eq!(server.internal_state(), InternalState::ProcessAdding);
    assert_eq!(host.process_controller.count("start"), 0);

    host.inventory.handle_process_added(PROCESS);
    assert_eq!(server.internal_state(), InternalState::ProcessStarting);
    host.inventory.handle_process_started(PROCESS);
    assert_eq!(server.internal_state(), InternalState::SendStdin);
}

#[tokio::test]
async fn test_stop_overtakes_pending_channel_registration() {
    let host = test_host("host-a", true, RunningMode::Normal);
    host.inventory.start_server("server-one", &domain_model()).unwrap();
    host.inventory.handle_process_added(PROCESS);
    host.inventory.handle_process_started(PROCESS);
    let server = host.inventory.get_server("server-one").unwrap();
    assert_eq!(server.internal_state(), InternalState::SendStdin);

    assert_eq!(host.inventory.stop_server("server-one", None), ServerStatus::Stopping);
    assert_eq!(server.internal_state(), InternalState::ProcessStopping);
    assert_eq!(host.process_controller.count("stop"), 1);

    // the stale registration is refused and the stop keeps going
    let registered = host
        .inventory
        .server_communication_registered(PROCESS, TestChannel::new())
        .unwrap();
    assert!(!registered);
    assert_eq!(server.internal_state(), InternalState::ProcessStopping);
    assert_eq!(server.required_state(), RequiredState::Stopped);

    host.inventory.handle_process_stopped(PROCESS, 250);
    assert_eq!(server.internal_state(), InternalState::ProcessRemoving);
    host.inventory.handle_process_removed(PROCESS);
    assert!(host.inventory.get_server("server-one").is_none());
    assert_eq!(host.inventory.determine_server_status("server-one"), ServerStatus::Stopped);
}

#[tokio::test]
async fn test_unexpected_channel_close_reconnects() {
    let host = test_host("host-a", true, RunningMode::Normal);
    host.inventory.start_server("server-one", &domain_model()).unwrap();
    host.inventory.handle_process_added(PROCESS);
    host.inventory.handle_process_started(PROCESS);
    let channel = TestChannel::new();
    host.inventory
        .server_communication_registered(PROCESS, channel.clone())
        .unwrap();
    host.inventory.server_started(PROCESS, None);

    let server = host.inventory.get_server("server-one").unwrap();
    assert_eq!(server.internal_state(), InternalState::ServerStarted);

    use hostctl_core::domain::channel::ServerChannel;
    channel.close();

    let reached = timeout(Duration::from_secs(1), server.await_state(InternalState::SendStdin))
        .await
        .unwrap();
    assert!(reached);
    assert_eq!(server.required_state(), RequiredState::ServerStarted);
    assert_eq!(host.process_controller.count("reconnect"), 1);
    assert!(host.domain_controller.running_server("server-one").is_none());

    // the server reconnects on a fresh channel and is started again
    let fresh = TestChannel::new();
    assert!(host.inventory.server_reconnected(PROCESS, fresh).unwrap());
    assert_eq!(server.internal_state(), InternalState::ServerStarted);
    assert!(host.domain_controller.running_server("server-one").is_some());
}

#[tokio::test]
async fn test_unexpected_process_exit_marks_failed() {
    let host = test_host("host-a", true, RunningMode::Normal);
    host.inventory.start_server("server-one", &domain_model()).unwrap();
    host.inventory.handle_process_added(PROCESS);
    host.inventory.handle_process_started(PROCESS);

    host.inventory.handle_process_stopped(PROCESS, 10);

    let summary = host.inventory.server_summary("server-one").unwrap();
    assert_eq!(summary.status, ServerStatus::Failed);
    assert_eq!(summary.internal, InternalState::ProcessStopped);

    // a failed server can be started again
    assert_eq!(
        host.inventory.start_server("server-one", &domain_model()).unwrap(),
        ServerStatus::Starting
    );
}

#[tokio::test]
async fn test_one_server_failure_leaves_others_alone() {
    let host = test_host("host-a", true, RunningMode::Normal);
    host.inventory.start_server("server-one", &domain_model()).unwrap();
    host.inventory.start_server("server-two", &domain_model()).unwrap();

    host.inventory
        .handle_operation_failed(PROCESS, hostctl_core::domain::process::ProcessOperationType::Add);

    assert_eq!(host.inventory.determine_server_status("server-one"), ServerStatus::Failed);
    assert_eq!(host.inventory.determine_server_status("server-two"), ServerStatus::Starting);
}

#[tokio::test]
async fn test_concurrent_starts_from_tasks_add_once() {
    let host = test_host("host-a", true, RunningMode::Normal);
    let model = Arc::new(domain_model());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let inventory = host.inventory.clone();
            let model = model.clone();
            tokio::spawn(async move { inventory.start_server("server-one", &model) })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), ServerStatus::Starting);
    }
    assert_eq!(host.process_controller.count("add"), 1);
}

#[tokio::test]
async fn test_reload_sends_operation_on_channel() {
    let host = test_host("host-a", true, RunningMode::Normal);
    host.inventory.start_server("server-one", &domain_model()).unwrap();
    host.inventory.handle_process_added(PROCESS);
    host.inventory.handle_process_started(PROCESS);
    let channel = TestChannel::new();
    host.inventory
        .server_communication_registered(PROCESS, channel.clone())
        .unwrap();
    host.inventory.server_started(PROCESS, None);

    assert!(host.inventory.reload_server("server-one", 7).unwrap());
    assert_eq!(channel.sent().len(), 1);
    let server = host.inventory.get_server("server-one").unwrap();
    assert_eq!(server.internal_state(), InternalState::Reloading);

    // reloaded server reconnects, then reports started
    assert!(host
        .inventory
        .server_communication_registered(PROCESS, TestChannel::new())
        .unwrap());
    host.inventory.server_started(PROCESS, None);
    assert_eq!(server.internal_state(), InternalState::ServerStarted);
}
