// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Domain Model - the resolved domain-wide configuration tree
//
// The host controller treats the model mostly as opaque data: it is received
// from the master (or loaded locally), handed to the boot command factory and
// served back to slaves. Only the few sections needed to decide which servers
// to start are read here:
//
// - `server-group.<name>`: profile, launch command, environment, deployments
// - `host.<name>.server-config.<server>`: group, auto-start, environment

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainModel(Value);

impl Default for DomainModel {
    fn default() -> Self {
        Self(Value::Object(Default::default()))
    }
}

/// `host.<name>.server-config.<server>` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(skip)]
    pub name: String,
    pub group: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub launch_args: Vec<String>,
}

/// `server-group.<name>` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerGroup {
    pub profile: String,
    #[serde(default)]
    pub launch_command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub system_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub deployments: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl DomainModel {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let model = serde_yaml::from_str(yaml)?;
        Ok(model)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn host_names(&self) -> Vec<String> {
        self.0
            .get("host")
            .and_then(Value::as_object)
            .map(|hosts| hosts.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn server_group(&self, name: &str) -> Option<ServerGroup> {
        let value = self.0.get("server-group")?.get(name)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Profile section referenced by a server group.
    pub fn profile(&self, name: &str) -> Option<&Value> {
        self.0.get("profile")?.get(name)
    }

    pub fn server_config(&self, host: &str, server: &str) -> Option<ServerConfig> {
        let value = self.0.get("host")?.get(host)?.get("server-config")?.get(server)?;
        let mut config: ServerConfig = serde_json::from_value(value.clone()).ok()?;
        config.name = server.to_string();
        Some(config)
    }

    /// Servers configured for `host`, ordered by name.
    pub fn host_servers(&self, host: &str) -> Vec<ServerConfig> {
        let Some(servers) = self
            .0
            .get("host")
            .and_then(|hosts| hosts.get(host))
            .and_then(|h| h.get("server-config"))
            .and_then(Value::as_object)
        else {
            return Vec::new();
        };

        let mut names: Vec<&String> = servers.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.server_config(host, name))
            .collect()
    }
}
