// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Host controller core
//!
//! Supervises the server processes of one host and keeps the host registered
//! with the domain's master controller.
//!
//! # Architecture
//!
//! - **domain:** state machine, protocol messages, configuration and the
//!   traits the outer layers implement
//! - **application:** server inventory, master registration, boot sequence
//! - **infrastructure:** TCP transports and the event bus
//! - **presentation:** HTTP management API

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
