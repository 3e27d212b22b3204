// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::application::domain_controller::LocalDomainController;
use crate::application::server_inventory::{ServerInventory, ServerInventoryError, ServerSummary};
use crate::domain::boot::BootConfigurationError;
use crate::domain::domain_controller::DomainController;
use crate::domain::host_registrations::HostRegistrationSummary;
use crate::domain::managed_server::ManagedServerError;
use crate::domain::server_state::{InternalState, RequiredState, ServerStatus};
use crate::infrastructure::event_bus::{EventBus, EventBusError};

pub struct AppState {
    pub inventory: Arc<ServerInventory>,
    pub domain_controller: Arc<LocalDomainController>,
    pub event_bus: EventBus,
    /// Upper bound on how long a restart waits for the old process.
    pub stop_timeout: Duration,
    pub start_time: Instant,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers))
        .route("/servers/{name}", get(get_server))
        .route("/servers/{name}/start", post(start_server))
        .route("/servers/{name}/stop", post(stop_server))
        .route("/servers/{name}/restart", post(restart_server))
        .route("/servers/{name}/reload", post(reload_server))
        .route("/hosts", get(list_hosts))
        .route("/hosts/prune", post(prune_hosts))
        .route("/events", get(stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(server_name: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("no server named '{server_name}'"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ServerInventoryError> for ApiError {
    fn from(e: ServerInventoryError) -> Self {
        let status = match &e {
            ServerInventoryError::HostAlreadyShutdown => StatusCode::SERVICE_UNAVAILABLE,
            ServerInventoryError::UnknownServer(_)
            | ServerInventoryError::BootConfiguration(BootConfigurationError::UnknownServer(_))
            | ServerInventoryError::ManagedServer(ManagedServerError::BootConfiguration(
                BootConfigurationError::UnknownServer(_),
            )) => StatusCode::NOT_FOUND,
            ServerInventoryError::ManagedServer(ManagedServerError::TransitionInProgress { .. }) => {
                StatusCode::CONFLICT
            }
            ServerInventoryError::InventoryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerActionResponse {
    pub server_name: String,
    pub status: ServerStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopParams {
    /// Accepted for compatibility; the stop is always immediate
    pub graceful_timeout_ms: Option<u64>,
}

impl StopParams {
    fn graceful_timeout(&self) -> Option<Duration> {
        self.graceful_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadParams {
    #[serde(default)]
    pub permit: u32,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.inventory.is_shut_down() { "stopping" } else { "healthy" },
        "host_name": state.inventory.host_name(),
        "master": state.domain_controller.is_master(),
        "running_mode": state.domain_controller.running_mode(),
        "servers": state.inventory.server_summaries().len(),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

/// Servers in the inventory plus the ones configured for this host that
/// have never been started.
fn all_servers(state: &AppState) -> Vec<ServerSummary> {
    let mut summaries = state.inventory.server_summaries();
    let model = state.domain_controller.domain_model();
    for config in model.host_servers(state.domain_controller.local_host_name()) {
        if summaries.iter().any(|s| s.server_name == config.name) {
            continue;
        }
        summaries.push(ServerSummary {
            status: if config.auto_start {
                ServerStatus::Stopped
            } else {
                ServerStatus::Disabled
            },
            server_name: config.name,
            required: RequiredState::Stopped,
            internal: InternalState::Stopped,
            requires_reload: false,
        });
    }
    summaries.sort_by(|a, b| a.server_name.cmp(&b.server_name));
    summaries
}

async fn list_servers(State(state): State<Arc<AppState>>) -> Json<Vec<ServerSummary>> {
    Json(all_servers(&state))
}

async fn get_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ServerSummary>, ApiError> {
    all_servers(&state)
        .into_iter()
        .find(|s| s.server_name == name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&name))
}

async fn start_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ServerActionResponse>, ApiError> {
    info!(server_name = %name, "Start requested over API");
    let model = state.domain_controller.domain_model();
    let status = state.inventory.start_server(&name, &model)?;
    Ok(Json(ServerActionResponse {
        server_name: name,
        status,
    }))
}

async fn stop_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<StopParams>,
) -> Json<ServerActionResponse> {
    info!(server_name = %name, "Stop requested over API");
    let status = state.inventory.stop_server(&name, params.graceful_timeout());
    Json(ServerActionResponse {
        server_name: name,
        status,
    })
}

async fn restart_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<Json<ServerActionResponse>, ApiError> {
    info!(server_name = %name, "Restart requested over API");
    let model = state.domain_controller.domain_model();
    let restart = state
        .inventory
        .restart_server(&name, params.graceful_timeout(), &model);
    let status = tokio::time::timeout(state.stop_timeout, restart)
        .await
        .map_err(|_| {
            ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("server '{name}' did not stop within {:?}", state.stop_timeout),
            )
        })??;
    Ok(Json(ServerActionResponse {
        server_name: name,
        status,
    }))
}

async fn reload_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<ReloadParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.inventory.reload_server(&name, params.permit)? {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("server '{name}' is not started"),
        ));
    }
    Ok(Json(json!({ "server_name": name, "reloading": true })))
}

async fn list_hosts(State(state): State<Arc<AppState>>) -> Result<Json<Vec<HostRegistrationSummary>>, ApiError> {
    if !state.domain_controller.is_master() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "slave host registrations are only kept by the master",
        ));
    }
    Ok(Json(state.domain_controller.host_registrations().summaries()))
}

async fn prune_hosts(State(state): State<Arc<AppState>>) -> Json<Vec<HostRegistrationSummary>> {
    let registrations = state.domain_controller.host_registrations();
    registrations.prune_expired();
    registrations.prune_disconnected();
    Json(registrations.summaries())
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.event_bus.subscribe();
    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse) => return Some((Ok(sse), receiver)),
                    Err(e) => warn!(error = %e, "Failed to encode event for stream"),
                },
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
