// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Host Configuration Types
//
// Defines the configuration schema for a host controller, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Host identity, role (master or slave) and running mode
// - Domain controller and process controller endpoints
// - Management listener ports and inventory timeouts
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::boot::HostControllerEnvironment;
use crate::domain::domain_controller::RunningMode;

pub const API_VERSION: &str = "hostctl/v1";
pub const KIND: &str = "HostConfig";

/// Top-level host configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfigManifest {
    /// API version (must be "hostctl/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "HostConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: HostConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfigSpec {
    pub host: HostIdentity,

    /// Remote master (slave hosts only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_controller: Option<DomainControllerConfig>,

    #[serde(default)]
    pub process_controller: ProcessControllerConfig,

    #[serde(default)]
    pub management: ManagementConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Host name, unique within the domain
    pub name: String,

    #[serde(default)]
    pub running_mode: RunningMode,

    /// Whether this host is the master domain controller
    #[serde(default)]
    pub master: bool,

    /// Boot a slave from its local copy of the domain model
    #[serde(default)]
    pub use_cached_domain_model: bool,

    /// Domain model YAML used by a master or a cached-model slave
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_model_path: Option<PathBuf>,

    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainControllerConfig {
    /// Master registration endpoint (host:port)
    pub address: String,

    /// Interval between liveness pings to the master
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<Duration>,

    /// How long boot keeps retrying the first registration
    #[serde(default = "default_register_timeout", with = "humantime_serde")]
    pub register_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessControllerConfig {
    #[serde(default = "default_process_controller_address")]
    pub address: String,
}

impl Default for ProcessControllerConfig {
    fn default() -> Self {
        Self {
            address: default_process_controller_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Back-channel listener for managed servers
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Slave registration listener (master only)
    #[serde(default = "default_registration_port")]
    pub registration_port: u16,

    /// HTTP management API
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            server_port: default_server_port(),
            registration_port: default_registration_port(),
            api_port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_inventory_timeout", with = "humantime_serde")]
    pub inventory_timeout: Duration,

    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            inventory_timeout: default_inventory_timeout(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_home_dir() -> PathBuf {
    PathBuf::from("/opt/hostctl")
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostctl")
}

fn default_register_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_process_controller_address() -> String {
    "127.0.0.1:9991".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    9999
}

fn default_registration_port() -> u16 {
    9990
}

fn default_api_port() -> u16 {
    8090
}

fn default_inventory_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            running_mode: RunningMode::Normal,
            master: true,
            use_cached_domain_model: false,
            domain_model_path: None,
            home_dir: default_home_dir(),
            base_dir: default_base_dir(),
        }
    }
}

impl Default for HostConfigSpec {
    fn default() -> Self {
        Self {
            host: HostIdentity::default(),
            domain_controller: None,
            process_controller: ProcessControllerConfig::default(),
            management: ManagementConfig::default(),
            inventory: InventoryConfig::default(),
            observability: None,
        }
    }
}

impl Default for HostConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "default-host".to_string(),
                version: None,
                labels: None,
            },
            spec: HostConfigSpec::default(),
        }
    }
}

impl HostConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. HOSTCTL_CONFIG_PATH environment variable
    /// 2. ./hostctl-config.yaml (working directory)
    /// 3. ~/.hostctl/config.yaml (user home)
    /// 4. /etc/hostctl/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("HOSTCTL_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./hostctl-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".hostctl").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/hostctl/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("HOSTCTL_HOST_NAME") {
            tracing::info!("Environment override: HOSTCTL_HOST_NAME={}", name);
            self.spec.host.name = name;
        }

        if let Ok(val) = std::env::var("HOSTCTL_RUNNING_MODE") {
            match val.to_lowercase().as_str() {
                "normal" => self.spec.host.running_mode = RunningMode::Normal,
                "admin_only" | "admin-only" => self.spec.host.running_mode = RunningMode::AdminOnly,
                _ => {
                    tracing::warn!(
                        "Invalid value for HOSTCTL_RUNNING_MODE: '{}'. Expected normal/admin_only. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(address) = std::env::var("HOSTCTL_DOMAIN_CONTROLLER") {
            tracing::info!("Environment override: HOSTCTL_DOMAIN_CONTROLLER={}", address);
            self.spec.host.master = false;
            match &mut self.spec.domain_controller {
                Some(dc) => dc.address = address,
                None => {
                    self.spec.domain_controller = Some(DomainControllerConfig {
                        address,
                        heartbeat_interval: None,
                        register_timeout: default_register_timeout(),
                    })
                }
            }
        }

        if let Ok(address) = std::env::var("HOSTCTL_PROCESS_CONTROLLER") {
            tracing::info!("Environment override: HOSTCTL_PROCESS_CONTROLLER={}", address);
            self.spec.process_controller.address = address;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let host = &self.spec.host;
        if host.name.is_empty() {
            anyhow::bail!("spec.host.name cannot be empty");
        }

        if !host.master && !host.use_cached_domain_model && self.spec.domain_controller.is_none() {
            anyhow::bail!(
                "Slave host '{}' needs spec.domain_controller or use_cached_domain_model",
                host.name
            );
        }

        if let Some(dc) = &self.spec.domain_controller {
            if dc.address.is_empty() {
                anyhow::bail!("spec.domain_controller.address cannot be empty");
            }
        }

        let management = &self.spec.management;
        let ports = [
            ("server_port", management.server_port),
            ("registration_port", management.registration_port),
            ("api_port", management.api_port),
        ];
        for (i, (name, port)) in ports.iter().enumerate() {
            if let Some((other, _)) = ports[i + 1..].iter().find(|(_, p)| p == port) {
                anyhow::bail!("spec.management.{} and {} both use port {}", name, other, port);
            }
        }

        Ok(())
    }

    pub fn server_listen_address(&self) -> anyhow::Result<SocketAddr> {
        let m = &self.spec.management;
        Ok(format!("{}:{}", m.bind_address, m.server_port).parse()?)
    }

    pub fn registration_listen_address(&self) -> anyhow::Result<SocketAddr> {
        let m = &self.spec.management;
        Ok(format!("{}:{}", m.bind_address, m.registration_port).parse()?)
    }

    pub fn api_listen_address(&self) -> anyhow::Result<SocketAddr> {
        let m = &self.spec.management;
        Ok(format!("{}:{}", m.bind_address, m.api_port).parse()?)
    }

    pub fn host_environment(&self) -> HostControllerEnvironment {
        HostControllerEnvironment {
            host_name: self.spec.host.name.clone(),
            home_dir: self.spec.host.home_dir.clone(),
            base_dir: self.spec.host.base_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLAVE: &str = r#"
apiVersion: hostctl/v1
kind: HostConfig
metadata:
  name: host-b
spec:
  host:
    name: host-b
    running_mode: admin_only
  domain_controller:
    address: 10.0.0.1:9990
    heartbeat_interval: 15s
  inventory:
    inventory_timeout: 10s
"#;

    #[test]
    fn test_default_manifest() {
        let manifest = HostConfigManifest::default();
        assert_eq!(manifest.api_version, "hostctl/v1");
        assert_eq!(manifest.kind, "HostConfig");
        assert!(manifest.spec.host.master);
        assert_eq!(manifest.spec.management.server_port, 9999);
        assert_eq!(manifest.spec.inventory.inventory_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_slave() {
        let manifest = HostConfigManifest::from_yaml_str(SLAVE).unwrap();
        assert_eq!(manifest.spec.host.name, "host-b");
        assert!(!manifest.spec.host.master);
        assert_eq!(manifest.spec.host.running_mode, RunningMode::AdminOnly);

        let dc = manifest.spec.domain_controller.as_ref().unwrap();
        assert_eq!(dc.address, "10.0.0.1:9990");
        assert_eq!(dc.heartbeat_interval, Some(Duration::from_secs(15)));
        assert_eq!(dc.register_timeout, Duration::from_secs(30));
        assert_eq!(manifest.spec.inventory.inventory_timeout, Duration::from_secs(10));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostctl-config.yaml");

        let manifest = HostConfigManifest::from_yaml_str(SLAVE).unwrap();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = HostConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "host-b");
        assert_eq!(
            loaded.spec.domain_controller.unwrap().heartbeat_interval,
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = HostConfigManifest::load_or_default(Some(dir.path().join("missing.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation() {
        let mut manifest = HostConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.spec.management.api_port = manifest.spec.management.server_port;
        assert!(manifest.validate().is_err());
        manifest.spec.management.api_port = 8090;

        manifest.spec.host.master = false;
        assert!(manifest.validate().is_err());

        manifest.spec.host.use_cached_domain_model = true;
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_listen_addresses() {
        let manifest = HostConfigManifest::default();
        assert_eq!(
            manifest.server_listen_address().unwrap(),
            "127.0.0.1:9999".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(manifest.api_listen_address().unwrap().port(), 8090);
    }
}
