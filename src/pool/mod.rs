//! Multi-broker connection pool
//!
//! The pool maps broker ids to [`Connection`] handles. The map is locked only
//! for lookups and structural changes; every awaited connection operation runs
//! after the lock is released, so a slow broker never stalls requests for the
//! others.
//!
//! # Components
//!
//! - [`backoff`] - Pure reconnection timing
//! - [`state`] - Connect outcomes and state machine positions
//! - [`connection`] - Per-broker connection actor

pub mod backoff;
pub mod connection;
pub mod state;

pub use backoff::{BackoffPolicy, ReconnectionDecision};
pub use connection::{Connection, ConnectionError};
pub use state::{ConnectResult, ConnectionSnapshot, ConnectionState};

use crate::broker::{Broker, BrokerId};
use crate::dispatcher::{BrokerDispatcher, MessageDispatcher};
use crate::error::{PoolError, PoolResult};
use crate::transport::{ConnectOptions, TransportFactory, TransportSettings};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Connection pool keyed by broker id
pub struct ConnectionPool {
    connections: Mutex<HashMap<BrokerId, Connection>>,
    factory: Arc<dyn TransportFactory>,
    dispatcher: Arc<dyn MessageDispatcher>,
    policy: BackoffPolicy,
    settings: TransportSettings,
}

impl ConnectionPool {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        dispatcher: Arc<dyn MessageDispatcher>,
        policy: BackoffPolicy,
        settings: TransportSettings,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            factory,
            dispatcher,
            policy,
            settings,
        }
    }

    /// Create and connect a connection for `broker` unless one exists
    ///
    /// Returns `None` when the broker already had a connection. A failed
    /// connect is logged and reported but the connection stays pooled; it owns
    /// its own recovery.
    pub async fn connect(&self, broker: &Broker) -> PoolResult<Option<ConnectResult>> {
        let connection = {
            let mut connections = self.connections.lock().await;
            if connections.contains_key(&broker.id) {
                debug!(broker_id = %broker.id, "Connection already pooled");
                return Ok(None);
            }

            let connection = self.create_connection(broker);
            connections.insert(broker.id, connection.clone());
            connection
        };

        let result = connection.connect().await?;
        log_connect_result(&connection, result);
        Ok(Some(result))
    }

    /// Disconnect and evict; no-op for unknown ids
    pub async fn disconnect(&self, broker_id: &BrokerId) -> PoolResult<()> {
        let removed = self.connections.lock().await.remove(broker_id);

        match removed {
            Some(connection) => {
                if connection.is_started() {
                    connection.disconnect().await?;
                }
                info!(broker_id = %broker_id, "Connection removed from pool");
                Ok(())
            }
            None => {
                debug!(broker_id = %broker_id, "Disconnect ignored, no connection");
                Ok(())
            }
        }
    }

    /// Subscribe a pooled broker to `topics`, connecting it first if needed
    pub async fn add_listeners(&self, broker_id: &BrokerId, topics: &[String]) -> PoolResult<()> {
        let connection = self.get(broker_id).await?;

        if !connection.is_started() {
            let result = connection.connect().await?;
            log_connect_result(&connection, result);
        }

        connection.add_subscriptions(topics).await?;
        Ok(())
    }

    /// Unsubscribe `topics`; an idle started connection is disconnected and evicted
    pub async fn remove_listeners(
        &self,
        broker_id: &BrokerId,
        topics: &[String],
    ) -> PoolResult<()> {
        let connection = self.get(broker_id).await?;
        connection.remove_subscriptions(topics).await?;

        if connection.has_subscriptions() || !connection.is_started() {
            return Ok(());
        }

        let evicted = {
            let mut connections = self.connections.lock().await;
            // Only evict the connection we just drained, not a replacement
            match connections.get(broker_id) {
                Some(current) if current.same_connection(&connection) => {
                    connections.remove(broker_id)
                }
                _ => None,
            }
        };

        if let Some(connection) = evicted {
            connection.disconnect().await?;
            info!(broker_id = %broker_id, "Idle connection disconnected and evicted");
        }
        Ok(())
    }

    pub async fn connection_exists(&self, broker_id: &BrokerId) -> bool {
        self.connections.lock().await.contains_key(broker_id)
    }

    /// False when the broker has no connection
    pub async fn listener_exists(&self, broker_id: &BrokerId, topic: &str) -> bool {
        self.connections
            .lock()
            .await
            .get(broker_id)
            .map(|connection| connection.has_subscriber(topic))
            .unwrap_or(false)
    }

    /// Current snapshot of a pooled connection
    pub async fn status(&self, broker_id: &BrokerId) -> Option<ConnectionSnapshot> {
        self.connections
            .lock()
            .await
            .get(broker_id)
            .map(Connection::snapshot)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn broker_ids(&self) -> Vec<BrokerId> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Disconnect and evict every connection
    pub async fn shutdown(&self) {
        let drained: Vec<Connection> = self
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        for connection in drained {
            if !connection.is_started() {
                continue;
            }
            if let Err(e) = connection.disconnect().await {
                warn!(broker_id = %connection.broker_id(), "Disconnect during shutdown failed: {}", e);
            }
        }
        info!("Connection pool shut down");
    }

    async fn get(&self, broker_id: &BrokerId) -> PoolResult<Connection> {
        self.connections
            .lock()
            .await
            .get(broker_id)
            .cloned()
            .ok_or(PoolError::NotFound(*broker_id))
    }

    fn create_connection(&self, broker: &Broker) -> Connection {
        let options = ConnectOptions::from_broker(broker, &self.settings);
        let transport = self.factory.create(broker);
        let dispatcher = Arc::new(BrokerDispatcher::new(broker.id, self.dispatcher.clone()));

        debug!(broker_id = %broker.id, address = %broker.address(), "Creating connection");
        Connection::spawn(options, transport, dispatcher, self.policy.clone())
    }
}

fn log_connect_result(connection: &Connection, result: ConnectResult) {
    match result {
        ConnectResult::Connected => info!(
            broker_id = %connection.broker_id(),
            address = %connection.address(),
            "Broker connected"
        ),
        other => error!(
            broker_id = %connection.broker_id(),
            address = %connection.address(),
            result = ?other,
            "Broker connect failed"
        ),
    }
}
