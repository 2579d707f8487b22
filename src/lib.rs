//! Multi-broker MQTT connection pool
//!
//! Maintains one supervised connection per broker, tracks each connection's
//! topic subscriptions, routes inbound messages to a [`MessageDispatcher`] and
//! recovers from dropped links with capped exponential backoff.
//!
//! # Overview
//!
//! - [`pool::ConnectionPool`] - Connections keyed by broker id
//! - [`pool::Connection`] - Per-broker lifecycle and reconnection state machine
//! - [`pool::BackoffPolicy`] - Pure retry timing
//! - [`transport`] - Wire-level client capability and its rumqttc implementation
//! - [`api::ControlApi`] - HTTP control surface
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_pool::broker::{Broker, Credentials};
//! use mqtt_pool::dispatcher::LoggingDispatcher;
//! use mqtt_pool::pool::{BackoffPolicy, ConnectionPool};
//! use mqtt_pool::transport::mqtt::MqttTransportFactory;
//! use mqtt_pool::transport::TransportSettings;
//! use std::sync::Arc;
//!
//! # async fn run() -> mqtt_pool::PoolResult<()> {
//! let pool = ConnectionPool::new(
//!     Arc::new(MqttTransportFactory),
//!     Arc::new(LoggingDispatcher::new()),
//!     BackoffPolicy::default(),
//!     TransportSettings::default(),
//! );
//!
//! let broker = Broker::new("localhost", 1883, Credentials::new("user", "pass"));
//! pool.connect(&broker).await?;
//! pool.add_listeners(&broker.id, &["sensors/#".to_string()]).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod pool;
pub mod testing;
pub mod transport;

pub use broker::{Broker, BrokerId, BrokerRegistry, Credentials};
pub use config::{AppConfig, ConfigError};
pub use dispatcher::{LoggingDispatcher, MessageDispatcher};
pub use error::{PoolError, PoolResult};
pub use pool::{BackoffPolicy, ConnectResult, Connection, ConnectionPool, ConnectionState};
