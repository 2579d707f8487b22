//! Connection state types shared by the connection actor and its observers

use crate::transport::{ConnectFailure, FailureKind};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::time::Instant;

/// Outcome of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectResult {
    Connected,
    /// Authentication rejected; never retried automatically
    InvalidCredentials,
    /// Socket level failure; retried with backoff
    NetworkIssue,
    /// Any other failure; retried with backoff
    Unspecified,
}

impl ConnectResult {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectResult::Connected)
    }

    /// Whether the failure warrants scheduling an automatic retry
    pub fn is_retryable(self) -> bool {
        matches!(self, ConnectResult::NetworkIssue | ConnectResult::Unspecified)
    }
}

impl From<&ConnectFailure> for ConnectResult {
    fn from(failure: &ConnectFailure) -> Self {
        match failure.kind {
            FailureKind::InvalidCredentials => ConnectResult::InvalidCredentials,
            FailureKind::SocketError => ConnectResult::NetworkIssue,
            FailureKind::Other => ConnectResult::Unspecified,
        }
    }
}

/// Reconnection state machine position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not requested, or explicitly disconnected
    Idle,
    /// A connect call is in flight
    Connecting,
    /// Connected with no pending recovery
    Stable,
    /// Link lost; a retry timer is armed
    AwaitingRetry {
        attempt: u32,
        first_failure_at: Instant,
        next_attempt_at: Instant,
    },
    /// Recovery abandoned; only an explicit connect resumes
    GivenUp { reason: String },
}

impl ConnectionState {
    /// Short label used in logs and status replies
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Stable => "stable",
            ConnectionState::AwaitingRetry { .. } => "awaiting_retry",
            ConnectionState::GivenUp { .. } => "given_up",
        }
    }

    pub fn is_awaiting_retry(&self) -> bool {
        matches!(self, ConnectionState::AwaitingRetry { .. })
    }

    pub fn is_given_up(&self) -> bool {
        matches!(self, ConnectionState::GivenUp { .. })
    }
}

/// Point-in-time view of a connection, published after every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connection_requested: bool,
    pub disconnection_requested: bool,
    pub transport_connected: bool,
    pub state: ConnectionState,
    pub subscribed_topics: BTreeSet<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            connection_requested: false,
            disconnection_requested: false,
            transport_connected: false,
            state: ConnectionState::Idle,
            subscribed_topics: BTreeSet::new(),
        }
    }
}
