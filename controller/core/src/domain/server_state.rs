// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Managed server state model
//!
//! A managed server tracks two independent values: the state the host wants it
//! in ([`RequiredState`]) and the state it has actually reached
//! ([`InternalState`]). The driver in [`crate::domain::managed_server`] walks
//! the internal state one step at a time using [`next_state`], which is a pure
//! lookup over the legal adjacency.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Actual progress of a managed server, including in-flight sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalState {
    Stopped,
    ProcessAdding,
    ProcessAdded,
    ProcessStarting,
    ProcessStarted,
    SendStdin,
    ServerStarting,
    ServerStarted,
    Reloading,
    ProcessStopping,
    ProcessStopped,
    ProcessRemoving,
    Failed,
}

impl InternalState {
    pub const ALL: [InternalState; 13] = [
        InternalState::Stopped,
        InternalState::ProcessAdding,
        InternalState::ProcessAdded,
        InternalState::ProcessStarting,
        InternalState::ProcessStarted,
        InternalState::SendStdin,
        InternalState::ServerStarting,
        InternalState::ServerStarted,
        InternalState::Reloading,
        InternalState::ProcessStopping,
        InternalState::ProcessStopped,
        InternalState::ProcessRemoving,
        InternalState::Failed,
    ];

    /// Asynchronous states wait for a notification from the process
    /// controller or the server itself. The driver never leaves them on its
    /// own initiative.
    pub const fn is_async(self) -> bool {
        matches!(
            self,
            InternalState::ProcessAdding
                | InternalState::ProcessStarting
                | InternalState::SendStdin
                | InternalState::ServerStarting
                | InternalState::Reloading
                | InternalState::ProcessStopping
                | InternalState::ProcessRemoving
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            InternalState::Stopped => "STOPPED",
            InternalState::ProcessAdding => "PROCESS_ADDING",
            InternalState::ProcessAdded => "PROCESS_ADDED",
            InternalState::ProcessStarting => "PROCESS_STARTING",
            InternalState::ProcessStarted => "PROCESS_STARTED",
            InternalState::SendStdin => "SEND_STDIN",
            InternalState::ServerStarting => "SERVER_STARTING",
            InternalState::ServerStarted => "SERVER_STARTED",
            InternalState::Reloading => "RELOADING",
            InternalState::ProcessStopping => "PROCESS_STOPPING",
            InternalState::ProcessStopped => "PROCESS_STOPPED",
            InternalState::ProcessRemoving => "PROCESS_REMOVING",
            InternalState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target state requested by the owning inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequiredState {
    ServerStarted,
    Stopped,
    Failed,
}

impl fmt::Display for RequiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequiredState::ServerStarted => "SERVER_STARTED",
            RequiredState::Stopped => "STOPPED",
            RequiredState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Caller-facing server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    /// Configured but not set to start automatically
    Disabled,
    Stopped,
    Starting,
    Started,
    Stopping,
    Failed,
}

impl ServerStatus {
    /// Statuses a blocking `stop_servers` waits for.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ServerStatus::Disabled | ServerStatus::Failed | ServerStatus::Stopped
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Disabled => "DISABLED",
            ServerStatus::Stopped => "STOPPED",
            ServerStatus::Starting => "STARTING",
            ServerStatus::Started => "STARTED",
            ServerStatus::Stopping => "STOPPING",
            ServerStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Next internal state on the way from `current` toward `required`.
///
/// `None` means there is nothing to do: the target is reached, the current
/// state can only be left by a notification, or the server has failed.
pub const fn next_state(current: InternalState, required: RequiredState) -> Option<InternalState> {
    use InternalState as S;
    use RequiredState as R;

    match (current, required) {
        (_, R::Failed) => None,
        (S::Stopped, R::ServerStarted) => Some(S::ProcessAdding),
        (S::Stopped, R::Stopped) => None,
        (S::ProcessAdding, R::ServerStarted) => Some(S::ProcessAdded),
        (S::ProcessAdding, R::Stopped) => None,
        (S::ProcessAdded, R::ServerStarted) => Some(S::ProcessStarting),
        (S::ProcessAdded, R::Stopped) => Some(S::ProcessRemoving),
        (S::ProcessStarting, R::ServerStarted) => Some(S::ProcessStarted),
        (S::ProcessStarting, R::Stopped) => None,
        (S::ProcessStarted, R::ServerStarted) => Some(S::SendStdin),
        (S::ProcessStarted, R::Stopped) => Some(S::ProcessStopping),
        (S::SendStdin, R::ServerStarted) => Some(S::ServerStarting),
        (S::SendStdin, R::Stopped) => Some(S::ProcessStopping),
        (S::ServerStarting, R::ServerStarted) => Some(S::ServerStarted),
        (S::ServerStarting, R::Stopped) => Some(S::ProcessStopping),
        (S::ServerStarted, R::ServerStarted) => None,
        (S::ServerStarted, R::Stopped) => Some(S::ProcessStopping),
        (S::Reloading, R::ServerStarted) => Some(S::ServerStarted),
        (S::Reloading, R::Stopped) => Some(S::ProcessStopping),
        (S::ProcessStopping, R::ServerStarted) => None,
        (S::ProcessStopping, R::Stopped) => Some(S::ProcessStopped),
        (S::ProcessStopped, R::ServerStarted) => Some(S::ProcessStarting),
        (S::ProcessStopped, R::Stopped) => Some(S::ProcessRemoving),
        (S::ProcessRemoving, R::ServerStarted) => None,
        (S::ProcessRemoving, R::Stopped) => Some(S::Stopped),
        (S::Failed, _) => None,
    }
}

/// State a server falls back to when a task fails while in `failed_in`.
pub const fn failure_fallback(failed_in: InternalState) -> InternalState {
    use InternalState as S;

    match failed_in {
        S::Stopped | S::ProcessAdding => S::Stopped,
        S::ProcessAdded | S::ProcessStarting => S::ProcessAdded,
        S::ProcessStarted | S::SendStdin | S::ServerStarting => S::ProcessStarted,
        S::ServerStarted | S::Reloading => S::ServerStarted,
        S::ProcessStopped => S::ProcessStopped,
        S::ProcessStopping | S::ProcessRemoving | S::Failed => S::Failed,
    }
}

/// Derive the caller-facing status from the two state values.
pub const fn server_status(required: RequiredState, internal: InternalState) -> ServerStatus {
    match (required, internal) {
        (RequiredState::Failed, _) | (_, InternalState::Failed) => ServerStatus::Failed,
        (_, InternalState::Stopped) => ServerStatus::Stopped,
        (_, InternalState::ServerStarted) => ServerStatus::Started,
        (RequiredState::ServerStarted, _) => ServerStatus::Starting,
        (RequiredState::Stopped, _) => ServerStatus::Stopping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    /// Edges taken when an external notification completes an async state.
    fn notification_successors(state: InternalState) -> &'static [InternalState] {
        use InternalState as S;
        match state {
            S::ProcessAdding => &[S::ProcessAdded],
            S::ProcessStarting => &[S::ProcessStarted],
            S::SendStdin => &[S::ServerStarting],
            S::ServerStarting => &[S::ServerStarted],
            S::Reloading => &[S::ServerStarting],
            S::ProcessStopping => &[S::ProcessStopped],
            S::ProcessRemoving => &[S::Stopped],
            S::ServerStarted => &[S::Reloading, S::SendStdin],
            _ => &[],
        }
    }

    #[test]
    fn test_start_path_from_stopped() {
        let mut state = InternalState::Stopped;
        let mut path = vec![state];
        while let Some(next) = next_state(state, RequiredState::ServerStarted) {
            state = next;
            path.push(state);
        }

        assert_eq!(
            path,
            vec![
                InternalState::Stopped,
                InternalState::ProcessAdding,
                InternalState::ProcessAdded,
                InternalState::ProcessStarting,
                InternalState::ProcessStarted,
                InternalState::SendStdin,
                InternalState::ServerStarting,
                InternalState::ServerStarted,
            ]
        );
    }

    #[test]
    fn test_stop_path_from_started() {
        let mut state = InternalState::ServerStarted;
        let mut path = vec![state];
        while let Some(next) = next_state(state, RequiredState::Stopped) {
            state = next;
            path.push(state);
        }

        assert_eq!(
            path,
            vec![
                InternalState::ServerStarted,
                InternalState::ProcessStopping,
                InternalState::ProcessStopped,
                InternalState::ProcessRemoving,
                InternalState::Stopped,
            ]
        );
    }

    #[test]
    fn test_reload_resolves_forward() {
        assert_eq!(
            next_state(InternalState::Reloading, RequiredState::ServerStarted),
            Some(InternalState::ServerStarted)
        );
        assert_eq!(
            next_state(InternalState::Reloading, RequiredState::Stopped),
            Some(InternalState::ProcessStopping)
        );
    }

    #[test]
    fn test_failed_has_no_exit() {
        for required in [RequiredState::ServerStarted, RequiredState::Stopped, RequiredState::Failed] {
            assert_eq!(next_state(InternalState::Failed, required), None);
        }
        for state in InternalState::ALL {
            assert_eq!(next_state(state, RequiredState::Failed), None);
        }
    }

    #[test]
    fn test_every_state_reachable_from_stopped() {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([InternalState::Stopped]);

        while let Some(state) = queue.pop_front() {
            if !seen.insert(state) {
                continue;
            }
            for required in [RequiredState::ServerStarted, RequiredState::Stopped] {
                if let Some(next) = next_state(state, required) {
                    queue.push_back(next);
                }
            }
            queue.extend(notification_successors(state).iter().copied());
            queue.push_back(failure_fallback(state));
        }

        for state in InternalState::ALL {
            assert!(seen.contains(&state), "{state} is not reachable");
        }
    }

    #[test]
    fn test_fallbacks_are_synchronous() {
        for state in InternalState::ALL {
            let fallback = failure_fallback(state);
            assert!(
                fallback == InternalState::Failed || !fallback.is_async(),
                "fallback for {state} must be synchronous, got {fallback}"
            );
        }
    }

    #[test]
    fn test_failure_fallbacks() {
        assert_eq!(failure_fallback(InternalState::ProcessAdding), InternalState::Stopped);
        assert_eq!(failure_fallback(InternalState::ProcessStarting), InternalState::ProcessAdded);
        assert_eq!(failure_fallback(InternalState::SendStdin), InternalState::ProcessStarted);
        assert_eq!(failure_fallback(InternalState::ServerStarting), InternalState::ProcessStarted);
        assert_eq!(failure_fallback(InternalState::Reloading), InternalState::ServerStarted);
        assert_eq!(failure_fallback(InternalState::ProcessStopping), InternalState::Failed);
        assert_eq!(failure_fallback(InternalState::ProcessRemoving), InternalState::Failed);
    }

    #[test]
    fn test_server_status_mapping() {
        use InternalState as S;
        use RequiredState as R;

        assert_eq!(server_status(R::Stopped, S::Stopped), ServerStatus::Stopped);
        assert_eq!(server_status(R::ServerStarted, S::Stopped), ServerStatus::Stopped);
        assert_eq!(server_status(R::ServerStarted, S::ProcessAdding), ServerStatus::Starting);
        assert_eq!(server_status(R::ServerStarted, S::ServerStarted), ServerStatus::Started);
        assert_eq!(server_status(R::Stopped, S::ServerStarted), ServerStatus::Started);
        assert_eq!(server_status(R::Stopped, S::ProcessStopping), ServerStatus::Stopping);
        assert_eq!(server_status(R::Failed, S::ProcessAdded), ServerStatus::Failed);
        assert_eq!(server_status(R::ServerStarted, S::Failed), ServerStatus::Failed);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&ServerStatus::Starting).unwrap();
        assert_eq!(json, "\"STARTING\"");
        let state: InternalState = serde_json::from_str("\"SEND_STDIN\"").unwrap();
        assert_eq!(state, InternalState::SendStdin);
    }
}
