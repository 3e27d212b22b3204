// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the host controller management API

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use hostctl_core::application::server_inventory::ServerSummary;
use hostctl_core::domain::host_registrations::HostRegistrationSummary;
use hostctl_core::domain::server_state::ServerStatus;
use hostctl_core::infrastructure::event_bus::HostEvent;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerActionResponse {
    pub server_name: String,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub host_name: String,
    pub master: bool,
    pub running_mode: String,
    pub servers: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct HostctlClient {
    client: Client,
    base_url: String,
}

impl HostctlClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, port)
        } else {
            format!("http://{}:{}", host, port)
        };

        Ok(Self { client, base_url })
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .context("Failed to reach host controller")?;
        parse(response, "Health check failed").await
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        let response = self
            .client
            .get(format!("{}/servers", self.base_url))
            .send()
            .await
            .context("Failed to list servers")?;
        parse(response, "Failed to list servers").await
    }

    pub async fn get_server(&self, name: &str) -> Result<ServerSummary> {
        let response = self
            .client
            .get(format!("{}/servers/{}", self.base_url, name))
            .send()
            .await
            .context("Failed to get server")?;
        parse(response, "Failed to get server").await
    }

    pub async fn start_server(&self, name: &str) -> Result<ServerActionResponse> {
        self.server_action(name, "start", &[]).await
    }

    pub async fn stop_server(&self, name: &str, graceful_timeout_ms: Option<u64>) -> Result<ServerActionResponse> {
        let query: Vec<(&str, String)> = graceful_timeout_ms
            .map(|ms| vec![("graceful_timeout_ms", ms.to_string())])
            .unwrap_or_default();
        self.server_action(name, "stop", &query).await
    }

    pub async fn restart_server(
        &self,
        name: &str,
        graceful_timeout_ms: Option<u64>,
    ) -> Result<ServerActionResponse> {
        let query: Vec<(&str, String)> = graceful_timeout_ms
            .map(|ms| vec![("graceful_timeout_ms", ms.to_string())])
            .unwrap_or_default();
        self.server_action(name, "restart", &query).await
    }

    pub async fn reload_server(&self, name: &str, permit: u32) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/servers/{}/reload", self.base_url, name))
            .query(&[("permit", permit)])
            .send()
            .await
            .context("Failed to reload server")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to reload server: {}", error_text);
        }
        Ok(())
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostRegistrationSummary>> {
        let response = self
            .client
            .get(format!("{}/hosts", self.base_url))
            .send()
            .await
            .context("Failed to list hosts")?;
        parse(response, "Failed to list hosts").await
    }

    pub async fn prune_hosts(&self) -> Result<Vec<HostRegistrationSummary>> {
        let response = self
            .client
            .post(format!("{}/hosts/prune", self.base_url))
            .send()
            .await
            .context("Failed to prune hosts")?;
        parse(response, "Failed to prune hosts").await
    }

    /// Open the server-sent event stream. Feed the body chunks to an
    /// [`SseDecoder`].
    pub async fn events(&self) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(format!("{}/events", self.base_url))
            .header("accept", "text/event-stream")
            .send()
            .await
            .context("Failed to open event stream")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to open event stream: {}", error_text);
        }
        Ok(response)
    }

    async fn server_action(
        &self,
        name: &str,
        action: &str,
        query: &[(&str, String)],
    ) -> Result<ServerActionResponse> {
        let response = self
            .client
            .post(format!("{}/servers/{}/{}", self.base_url, name, action))
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to {} server", action))?;
        parse(response, &format!("Failed to {} server", action)).await
    }
}

async fn parse<T: DeserializeOwned>(response: reqwest::Response, failure: &str) -> Result<T> {
    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("{}: {}", failure, error_text);
    }
    response
        .json()
        .await
        .with_context(|| format!("{}: unexpected response body", failure))
}

/// Incremental decoder for the `data:` lines of a server-sent event stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a body chunk and return every event completed by it.
    /// Keep-alive comments and undecodable payloads are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<HostEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..end + 2).collect();
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str(&data.join("\n")) {
                Ok(event) => events.push(event),
                Err(e) => tracing::debug!(error = %e, "Skipping undecodable event"),
            }
        }
        events
    }
}
