// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use common::{domain_model, test_host, ScriptedMaster, TestHost, DOMAIN_MODEL};
use hostctl_core::application::host_controller::{BootError, HostController, HOST_CONTROLLER_ABORT_EXIT_CODE};
use hostctl_core::domain::auth::AuthKey;
use hostctl_core::domain::domain_controller::{DomainController, RunningMode};
use hostctl_core::domain::domain_model::DomainModel;
use hostctl_core::domain::host_config::HostConfigManifest;
use hostctl_core::domain::process::ProcessInfo;
use hostctl_core::domain::server_state::ServerStatus;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn slave_config(running_mode: &str) -> HostConfigManifest {
    HostConfigManifest::from_yaml_str(&format!(
        r#"
apiVersion: hostctl/v1
kind: HostConfig
metadata:
  name: host-b
spec:
  host:
    name: host-b
    running_mode: {running_mode}
  domain_controller:
    address: master:9990
    register_timeout: 1s
"#
    ))
    .unwrap()
}

fn master_config(model_path: &std::path::Path) -> HostConfigManifest {
    HostConfigManifest::from_yaml_str(&format!(
        r#"
apiVersion: hostctl/v1
kind: HostConfig
metadata:
  name: host-a
spec:
  host:
    name: host-a
    master: true
    domain_model_path: {}
"#,
        model_path.display()
    ))
    .unwrap()
}

fn host_controller(config: HostConfigManifest, host: &TestHost, master: Arc<ScriptedMaster>) -> HostController {
    HostController::new(
        config,
        host.domain_controller.clone(),
        host.inventory.clone(),
        master,
        host.event_bus.clone(),
    )
}

fn model_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(DOMAIN_MODEL.as_bytes()).unwrap();
    file
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_master_aborts_boot() {
    let host = test_host("host-b", false, RunningMode::Normal);
    let master = ScriptedMaster::new(domain_model());
    master.set_refusing(true);
    let controller = host_controller(slave_config("normal"), &host, master.clone());

    let error = controller.boot().await.unwrap_err();
    assert!(matches!(error, BootError::Registration(_)));
    assert_eq!(error.exit_code(), HOST_CONTROLLER_ABORT_EXIT_CODE);
    assert!(host.process_controller.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_admin_only_slave_boots_without_master() {
    let host = test_host("host-b", false, RunningMode::AdminOnly);
    let master = ScriptedMaster::new(domain_model());
    master.set_refusing(true);
    let controller = host_controller(slave_config("admin_only"), &host, master);

    controller.boot().await.unwrap();
    assert!(controller.master_connection().is_none());
    assert!(host.inventory.server_summaries().is_empty());
    assert!(host.process_controller.calls().is_empty());
}

#[tokio::test]
async fn test_slave_boot_applies_model_and_starts_servers() {
    let host = test_host("host-b", false, RunningMode::Normal);
    let master = ScriptedMaster::new(domain_model());
    let controller = host_controller(slave_config("normal"), &host, master);

    controller.boot().await.unwrap();

    assert_eq!(host.domain_controller.domain_model(), domain_model());
    assert!(controller.master_connection().is_some());
    assert_eq!(
        host.inventory.determine_server_status("server-three"),
        ServerStatus::Starting
    );
    assert_eq!(host.process_controller.count("add"), 1);
    assert_eq!(host.process_controller.count("inventory"), 1);

    controller.shutdown(Duration::from_millis(50)).await;
    assert!(host.inventory.is_shut_down());
}

#[tokio::test]
async fn test_master_boot_starts_auto_start_servers() {
    let host = test_host("host-a", true, RunningMode::Normal);
    let file = model_file();
    let controller = host_controller(master_config(file.path()), &host, ScriptedMaster::new(DomainModel::default()));

    controller.boot().await.unwrap();

    let names: Vec<String> = host
        .inventory
        .server_summaries()
        .into_iter()
        .map(|s| s.server_name)
        .collect();
    assert_eq!(names, vec!["server-one", "server-two"]);

    let statuses: HashMap<String, ServerStatus> = controller.start_servers().into_iter().collect();
    assert_eq!(statuses["server-idle"], ServerStatus::Disabled);
    assert_eq!(statuses["server-one"], ServerStatus::Starting);
    assert_eq!(host.process_controller.count("add"), 2);
}

#[tokio::test]
async fn test_master_with_missing_model_file_fails() {
    let host = test_host("host-a", true, RunningMode::Normal);
    let controller = host_controller(
        master_config(std::path::Path::new("/nonexistent/domain.yaml")),
        &host,
        ScriptedMaster::new(DomainModel::default()),
    );
    let error = controller.boot().await.unwrap_err();
    assert!(matches!(error, BootError::DomainModel { .. }));
    assert_eq!(error.exit_code(), 99);
}

#[tokio::test]
async fn test_boot_reattaches_surviving_processes() {
    let host = test_host("host-a", true, RunningMode::Normal);
    let key = AuthKey::generate();
    let mut processes = HashMap::new();
    processes.insert(
        "Server:server-one".to_string(),
        ProcessInfo {
            process_name: "Server:server-one".to_string(),
            auth_key: key.to_base64(),
            running: true,
            stopping: false,
        },
    );
    processes.insert(
        "HostController".to_string(),
        ProcessInfo {
            process_name: "HostController".to_string(),
            auth_key: AuthKey::generate().to_base64(),
            running: true,
            stopping: false,
        },
    );
    host.process_controller.set_inventory(processes);

    let file = model_file();
    let controller = host_controller(master_config(file.path()), &host, ScriptedMaster::new(DomainModel::default()));
    controller.boot().await.unwrap();

    let calls = host.process_controller.calls();
    assert!(calls.contains(&"reconnect Server:server-one".to_string()));
    assert!(!calls.contains(&"add Server:server-one".to_string()));
    assert!(calls.contains(&"add Server:server-two".to_string()));

    // the surviving process keeps the key it was launched with
    let server = host.inventory.get_server("server-one").unwrap();
    assert_eq!(server.auth_key(), &key);
}
