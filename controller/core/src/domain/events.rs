// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::server_state::{InternalState, RequiredState, ServerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerLifecycleEvent {
    StateChanged {
        server_name: String,
        required: RequiredState,
        internal: InternalState,
        status: ServerStatus,
        changed_at: DateTime<Utc>,
    },
    ServerRegistered {
        server_name: String,
        registered_at: DateTime<Utc>,
    },
    ServerUnregistered {
        server_name: String,
        unregistered_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainConnectionEvent {
    RegisteredWithMaster {
        host_name: String,
        master_address: String,
        registered_at: DateTime<Utc>,
    },
    MasterConnectionLost {
        master_address: String,
        lost_at: DateTime<Utc>,
    },
    SlaveRegistered {
        host_name: String,
        registered_at: DateTime<Utc>,
    },
    SlaveUnregistered {
        host_name: String,
        reason: String,
        unregistered_at: DateTime<Utc>,
    },
}
