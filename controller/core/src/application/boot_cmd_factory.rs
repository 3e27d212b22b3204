// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Builds a server's boot configuration from the domain model.
//!
//! The launch command is the group's command followed by the server's own
//! arguments. Environment layers, lowest first: server group, server config,
//! then the `HOSTCTL_*` identity variables. Group system properties and
//! deployments become boot operations replayed by the server after start.

use std::collections::HashMap;

use crate::domain::boot::{
    BootConfigurationError, BootConfigurationFactory, HostControllerEnvironment, ManagedServerBootConfiguration,
};
use crate::domain::channel::ManagementOperation;
use crate::domain::domain_model::DomainModel;

/// Profile key whose presence turns on a dedicated subsystem endpoint.
const SUBSYSTEM_ENDPOINT_KEY: &str = "subsystem-endpoint";

pub struct StandardBootCmdFactory {
    host_environment: HostControllerEnvironment,
}

impl StandardBootCmdFactory {
    pub fn new(host_environment: HostControllerEnvironment) -> Self {
        Self { host_environment }
    }
}

impl BootConfigurationFactory for StandardBootCmdFactory {
    fn create_configuration(
        &self,
        server_name: &str,
        domain_model: &DomainModel,
    ) -> Result<ManagedServerBootConfiguration, BootConfigurationError> {
        let host_name = &self.host_environment.host_name;
        let server = domain_model
            .server_config(host_name, server_name)
            .ok_or_else(|| BootConfigurationError::UnknownServer(server_name.to_string()))?;
        let group = domain_model.server_group(&server.group).ok_or_else(|| {
            BootConfigurationError::UnknownServerGroup {
                server: server_name.to_string(),
                group: server.group.clone(),
            }
        })?;

        if group.launch_command.is_empty() {
            return Err(BootConfigurationError::MissingLaunchCommand(server.group));
        }
        let mut launch_command = group.launch_command.clone();
        launch_command.extend(server.launch_args.iter().cloned());

        let working_directory = self.host_environment.server_base_dir(server_name);
        let mut environment: HashMap<String, String> = group.environment.clone();
        environment.extend(server.environment.clone());
        environment.insert("HOSTCTL_SERVER_NAME".to_string(), server_name.to_string());
        environment.insert("HOSTCTL_HOST_NAME".to_string(), host_name.clone());
        environment.insert("HOSTCTL_SERVER_GROUP".to_string(), server.group.clone());
        environment.insert(
            "HOSTCTL_SERVER_BASE_DIR".to_string(),
            working_directory.display().to_string(),
        );

        let mut boot_operations: Vec<ManagementOperation> = group
            .system_properties
            .iter()
            .map(|(name, value)| {
                ManagementOperation::new("add", vec![("system-property".to_string(), name.clone())])
                    .with_parameters(serde_json::json!({ "value": value }))
            })
            .collect();
        boot_operations.extend(group.deployments.iter().map(|deployment| {
            ManagementOperation::new("deploy", vec![("deployment".to_string(), deployment.clone())])
        }));

        let subsystem_endpoint_configuration = domain_model
            .profile(&group.profile)
            .and_then(|profile| profile.get(SUBSYSTEM_ENDPOINT_KEY))
            .filter(|value| !value.is_null())
            .cloned();

        Ok(ManagedServerBootConfiguration {
            launch_command,
            environment,
            working_directory,
            host_environment: self.host_environment.clone(),
            managed_subsystem_endpoint: subsystem_endpoint_configuration.is_some(),
            subsystem_endpoint_configuration,
            boot_operations,
        })
    }
}
