//! Broker records and the in-memory broker registry
//!
//! A [`Broker`] is owned by the registry; the pool only ever receives a
//! snapshot of it when a connection is opened or refreshed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Opaque unique broker identity
pub type BrokerId = Uuid;

/// Login/password pair forwarded to the broker on connect
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

// Passwords never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

/// A messaging endpoint identified by address and credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    pub id: BrokerId,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl Broker {
    /// Create a broker record with a freshly generated id
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self::with_id(Uuid::new_v4(), host, port, credentials)
    }

    pub fn with_id(
        id: BrokerId,
        host: impl Into<String>,
        port: u16,
        credentials: Credentials,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            credentials,
        }
    }

    /// `host:port` form used in log lines
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Apply a partial update; `None` fields are left untouched
    pub fn apply(&mut self, update: &BrokerUpdate) {
        if let Some(host) = &update.host {
            self.host = host.clone();
        }
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(login) = &update.login {
            self.credentials.login = login.clone();
        }
        if let Some(password) = &update.password {
            self.credentials.password = password.clone();
        }
    }
}

/// Partial update of a broker's mutable fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BrokerUpdate {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl BrokerUpdate {
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none() && self.login.is_none() && self.password.is_none()
    }
}

/// In-memory broker registry
///
/// Durability is out of scope; records live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct BrokerRegistry {
    brokers: RwLock<HashMap<BrokerId, Broker>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a broker record
    pub async fn add(&self, broker: Broker) {
        self.brokers.write().await.insert(broker.id, broker);
    }

    pub async fn get(&self, id: &BrokerId) -> Option<Broker> {
        self.brokers.read().await.get(id).cloned()
    }

    /// Apply `update` to the stored record and return the new snapshot
    pub async fn update(&self, id: &BrokerId, update: &BrokerUpdate) -> Option<Broker> {
        let mut brokers = self.brokers.write().await;
        let broker = brokers.get_mut(id)?;
        broker.apply(update);
        Some(broker.clone())
    }

    pub async fn len(&self) -> usize {
        self.brokers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.brokers.read().await.is_empty()
    }
}
