//! Transport client abstraction
//!
//! A [`Transport`] is the wire-level MQTT client a connection drives. The pool
//! never shares a transport between connections: every connection receives its
//! own instance from a [`TransportFactory`], which keeps client construction
//! out of the connection logic and lets tests inject a fake.

use crate::broker::{Broker, BrokerId, Credentials};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Classification of a rejected connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The broker rejected the login/password
    InvalidCredentials,
    /// Socket level failure (unreachable host, refused, reset)
    SocketError,
    /// Anything else
    Other,
}

/// A failed connect attempt with its classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct ConnectFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ConnectFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidCredentials, message)
    }

    pub fn socket(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SocketError, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

/// Transport operation errors other than connect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Subscribe to '{topic}' failed: {message}")]
    SubscribeFailed { topic: String, message: String },
    #[error("Unsubscribe from '{topic}' failed: {message}")]
    UnsubscribeFailed { topic: String, message: String },
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// Events a transport reports to the connection that owns it
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker acknowledged a connection
    Connected,
    /// The link went down; `requested` is true when our own disconnect caused it
    Disconnected { requested: bool, reason: String },
    /// A connect attempt was rejected
    ConnectingFailed(ConnectFailure),
    /// A publish arrived on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
}

/// Everything a transport needs to open a link to one broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub broker_id: BrokerId,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn from_broker(broker: &Broker, settings: &TransportSettings) -> Self {
        Self {
            broker_id: broker.id,
            host: broker.host.clone(),
            port: broker.port,
            credentials: broker.credentials.clone(),
            keep_alive: settings.keep_alive,
            connect_timeout: settings.connect_timeout,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Transport tuning shared by every connection in a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Wire-level MQTT client driven by a single connection
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Open the link; resolves once the broker acknowledged or rejected it
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), ConnectFailure>;

    /// Close the link; the resulting `Disconnected` event carries `requested = true`
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Attach the sink that receives this transport's events
    fn attach(&mut self, events: mpsc::UnboundedSender<TransportEvent>);
}

/// Builds one transport per connection
pub trait TransportFactory: Send + Sync {
    fn create(&self, broker: &Broker) -> Box<dyn Transport>;
}
