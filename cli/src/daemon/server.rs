// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground host controller process

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hostctl_core::application::boot_cmd_factory::StandardBootCmdFactory;
use hostctl_core::application::domain_controller::LocalDomainController;
use hostctl_core::application::host_controller::HostController;
use hostctl_core::application::registration_handler::HostRegistrationHandler;
use hostctl_core::application::server_inventory::ServerInventory;
use hostctl_core::domain::boot::OperationIdCounter;
use hostctl_core::domain::host_config::HostConfigManifest;
use hostctl_core::infrastructure::domain_transport::{serve_registrations, TcpDomainConnector};
use hostctl_core::infrastructure::event_bus::EventBus;
use hostctl_core::infrastructure::process_controller::TcpProcessControllerClient;
use hostctl_core::infrastructure::server_endpoint;
use hostctl_core::presentation::api::{app, AppState};

pub async fn run_host_controller(config: HostConfigManifest) -> Result<()> {
    config.validate().context("Configuration validation failed")?;

    let host = &config.spec.host;
    info!(
        host_name = %host.name,
        master = host.master,
        running_mode = %host.running_mode,
        "hostctl starting (PID: {})",
        std::process::id()
    );

    if let Some(metrics) = config.spec.observability.as_ref().and_then(|o| o.metrics.as_ref()) {
        if metrics.enabled {
            let addr: SocketAddr = ([0, 0, 0, 0], metrics.port).into();
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("Failed to install Prometheus exporter")?;
            info!(address = %addr, "Prometheus metrics exporter listening");
        }
    }

    let event_bus = EventBus::with_default_capacity();
    let (process_controller, notifications) =
        TcpProcessControllerClient::connect(&config.spec.process_controller.address)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to process controller at {}",
                    config.spec.process_controller.address
                )
            })?;

    let domain_controller = Arc::new(LocalDomainController::new(
        host.name.clone(),
        host.master,
        host.running_mode,
        event_bus.clone(),
    ));
    let server_address = config.server_listen_address()?;
    let inventory = ServerInventory::new(
        domain_controller.clone(),
        Arc::new(process_controller),
        Arc::new(StandardBootCmdFactory::new(config.host_environment())),
        Arc::new(OperationIdCounter::new()),
        server_address,
        Some(Arc::new(event_bus.clone())),
        config.spec.inventory.inventory_timeout,
    );
    notifications.spawn_dispatcher(inventory.clone());

    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(server_address)
        .await
        .with_context(|| format!("Failed to bind to {}", server_address))?;
    info!(address = %server_address, "Server back-channel listening");
    tokio::spawn(server_endpoint::serve(listener, inventory.clone(), shutdown.clone()));

    if host.master {
        let addr = config.registration_listen_address()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!(address = %addr, "Slave registration listening");
        tokio::spawn(serve_registrations(
            listener,
            HostRegistrationHandler::new(domain_controller.clone()),
            shutdown.clone(),
        ));
    }

    let stop_timeout = config.spec.inventory.stop_timeout;
    let api = app(AppState {
        inventory: inventory.clone(),
        domain_controller: domain_controller.clone(),
        event_bus: event_bus.clone(),
        stop_timeout,
        start_time: Instant::now(),
    });
    let api_address = config.api_listen_address()?;
    let listener = TcpListener::bind(api_address)
        .await
        .with_context(|| format!("Failed to bind to {}", api_address))?;
    info!(address = %api_address, "Management API listening");
    let api_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api)
            .with_graceful_shutdown(api_shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "Management API failed");
        }
    });

    let controller = HostController::new(
        config.clone(),
        domain_controller,
        inventory,
        Arc::new(TcpDomainConnector::default()),
        event_bus,
    );

    if let Err(e) = controller.boot().await {
        error!(error = %e, "Host controller boot failed, aborting");
        shutdown.cancel();
        std::process::exit(e.exit_code());
    }
    info!("Host controller started");

    shutdown_signal().await;

    info!("Host controller shutting down");
    controller.shutdown(stop_timeout).await;
    shutdown.cancel();
    info!("Host controller stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
