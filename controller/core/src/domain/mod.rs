// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer (`hostctl-core`)
//!
//! Pure types and contracts. Nothing in here opens a socket; transports are
//! reached through the traits in [`process`], [`channel`] and
//! [`registration`].

pub mod auth;
pub mod boot;
pub mod channel;
pub mod domain_controller;
pub mod domain_model;
pub mod events;
pub mod host_config;
pub mod host_registrations;
pub mod managed_server;
pub mod process;
pub mod registration;
pub mod server_state;
