// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Handles:
//! - Wiring the host controller services from configuration
//! - Listener lifecycle (server back-channel, slave registrations, management API)
//! - Graceful shutdown

pub mod client;
pub mod server;

pub use client::HostctlClient;
pub use server::run_host_controller;
