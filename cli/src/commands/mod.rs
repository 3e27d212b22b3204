// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the hostctl CLI

pub mod config;
pub mod events;
pub mod host;
pub mod server;

pub use self::config::ConfigCommand;
pub use self::host::HostCommand;
pub use self::server::ServerCommand;
