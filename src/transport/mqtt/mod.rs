//! rumqttc-backed implementation of the [`Transport`](crate::transport::Transport) capability
//!
//! # Architecture
//!
//! - [`options`] - Pure mapping from connect options to rumqttc options
//! - [`message_handler`] - Pure event routing and failure classification
//! - [`client`] - Impure I/O: event-loop task and client operations
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_pool::broker::{Broker, Credentials};
//! use mqtt_pool::transport::mqtt::MqttTransport;
//! use mqtt_pool::transport::{ConnectOptions, Transport, TransportSettings};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new("localhost", 1883, Credentials::new("user", "pass"));
//! let options = ConnectOptions::from_broker(&broker, &TransportSettings::default());
//!
//! let mut transport = MqttTransport::new();
//! transport.connect(&options).await?;
//! transport.subscribe("sensors/#").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod message_handler;
pub mod options;

pub use client::{MqttTransport, MqttTransportFactory};
pub use message_handler::{EventRoute, MessageHandler};
pub use options::configure_mqtt_options;
