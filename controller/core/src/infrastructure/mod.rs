// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod process_controller;
pub mod server_endpoint;
pub mod domain_transport;
pub mod framing;
