// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod server_inventory;
pub mod remote_domain_connection;
pub mod registration_handler;
pub mod domain_controller;
pub mod host_controller;
pub mod boot_cmd_factory;

pub use boot_cmd_factory::StandardBootCmdFactory;
pub use domain_controller::LocalDomainController;
pub use host_controller::{BootError, HostController, HOST_CONTROLLER_ABORT_EXIT_CODE};
pub use server_inventory::{ServerInventory, ServerInventoryError, ServerSummary};
