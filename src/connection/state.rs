//! Connection lifecycle state.

use serde::{Deserialize, Serialize};

/// Lifecycle of the serial link, owned by the connection monitor.
///
/// # State Machine
///
/// ```text
/// Disconnected ──open──> Connecting ──probe ok──> Connected
///      ▲                  │    ▲                      │
///      │  budget spent    │    │                      │ I/O error, EOF,
///      └──────────────────┘    │                      │ reconnect request
///                              │                      ▼
///                              └─────delay──────  Reconnecting
///
/// any state ──stop──> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link and no attempt in progress
    Disconnected,
    /// Opening the port and running the liveness probe
    Connecting,
    /// Probe answered; commands can be served
    Connected,
    /// Link lost; waiting before the next attempt
    Reconnecting,
    /// Monitor exited. Terminal.
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ConnectionState {
    /// Whether the monitor may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Reconnecting)
            | (Reconnecting, Connecting) => true,
            _ => false,
        }
    }

    /// Whether commands can be served.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the monitor has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Disconnected));
    }

    #[test]
    fn stop_is_reachable_and_terminal() {
        for state in [Disconnected, Connecting, Connected, Reconnecting] {
            assert!(state.can_transition_to(Stopped));
        }
        assert!(!Stopped.can_transition_to(Connecting));
        assert!(!Stopped.can_transition_to(Stopped));
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn shortcuts_are_rejected() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Reconnecting.can_transition_to(Connected));
    }
}
