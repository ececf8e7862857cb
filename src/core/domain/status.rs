//! Per-endpoint connection state machine types and status snapshots.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of one endpoint's connection.
///
/// The pool owns all transitions. `Destroying` is terminal except for the
/// release back to `Idle` once cleanup finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    AuthFailed,
    NetworkError,
    RetryScheduled,
    Destroying,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AuthFailed => "auth_failed",
            Self::NetworkError => "network_error",
            Self::RetryScheduled => "retry_scheduled",
            Self::Destroying => "destroying",
        }
    }

    /// Transition legality. From `Destroying` only `Idle` is reachable.
    pub fn may_transition_to(&self, next: ConnectionState) -> bool {
        match self {
            Self::Destroying => next == Self::Idle,
            _ => true,
        }
    }

    /// Label delivered to consumers through their status hook.
    pub fn node_status(&self) -> NodeStatus {
        match self {
            Self::Idle | Self::Destroying => NodeStatus::Disconnected,
            Self::Connecting => NodeStatus::Connecting,
            Self::Connected => NodeStatus::Ready,
            Self::AuthFailed => NodeStatus::FailedPermanently,
            Self::NetworkError | Self::RetryScheduled => NodeStatus::Retrying,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer-facing connection status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Connecting,
    Disconnected,
    Retrying,
    FailedPermanently,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
            Self::Retrying => "retrying",
            Self::FailedPermanently => "failed_permanently",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session counters exposed through the status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub session_id: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub pending_callbacks: usize,
    pub queued_sends: usize,
    pub token_rotations: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SslStatus {
    pub enabled: bool,
    pub protocol: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub method: &'static str,
    pub authenticated: bool,
}

/// Synchronous snapshot returned by `get_connection_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub ready: bool,
    pub status: ConnectionState,
    pub server_id: String,
    pub ssl: SslStatus,
    pub authentication: AuthStatus,
    pub reconnection_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_stats: Option<SessionStats>,
}

impl ConnectionStatus {
    /// Snapshot for an endpoint the pool has never seen.
    pub fn idle(server_id: &str) -> Self {
        Self {
            connected: false,
            ready: false,
            status: ConnectionState::Idle,
            server_id: server_id.to_string(),
            ssl: SslStatus { enabled: false, protocol: "ws" },
            authentication: AuthStatus { method: "none", authenticated: false },
            reconnection_attempts: 0,
            client_stats: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroying_only_releases_to_idle() {
        let all = [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::AuthFailed,
            ConnectionState::NetworkError,
            ConnectionState::RetryScheduled,
            ConnectionState::Destroying,
        ];
        for next in all {
            let legal = ConnectionState::Destroying.may_transition_to(next);
            assert_eq!(legal, next == ConnectionState::Idle, "destroying -> {next}");
        }
    }

    #[test]
    fn test_other_states_transition_freely() {
        assert!(ConnectionState::Connected.may_transition_to(ConnectionState::NetworkError));
        assert!(ConnectionState::NetworkError.may_transition_to(ConnectionState::RetryScheduled));
        assert!(ConnectionState::Connecting.may_transition_to(ConnectionState::AuthFailed));
    }

    #[test]
    fn test_node_status_mapping() {
        assert_eq!(ConnectionState::Idle.node_status(), NodeStatus::Disconnected);
        assert_eq!(ConnectionState::Connecting.node_status(), NodeStatus::Connecting);
        assert_eq!(ConnectionState::Connected.node_status(), NodeStatus::Ready);
        assert_eq!(ConnectionState::AuthFailed.node_status(), NodeStatus::FailedPermanently);
        assert_eq!(ConnectionState::NetworkError.node_status(), NodeStatus::Retrying);
        assert_eq!(ConnectionState::RetryScheduled.node_status(), NodeStatus::Retrying);
        assert_eq!(ConnectionState::Destroying.node_status(), NodeStatus::Disconnected);
    }
}
