// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`hostctl-core`)
//!
//! HTTP surface that translates management requests into inventory and
//! domain controller calls. No state machine logic lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/SSE (Axum) | Server control, slave host listing, event stream |

pub mod api;
