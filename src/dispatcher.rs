//! Inbound message dispatch
//!
//! Connections hand every received message to a [`MessageDispatcher`]. What the
//! dispatcher does with it is application specific; the stock
//! [`LoggingDispatcher`] just records it.

use crate::broker::BrokerId;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Dispatcher failures. Logged by the caller, never fed back into connection state.
#[derive(Debug, Error)]
#[error("Dispatch failed on topic '{topic}': {message}")]
pub struct DispatchError {
    pub topic: String,
    pub message: String,
}

impl DispatchError {
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

/// Consumer of inbound (topic, payload) pairs
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Handle one message; `payload` is the UTF-8 decoded message body
    async fn dispatch(&self, topic: &str, payload: &str) -> Result<(), DispatchError>;
}

/// Dispatcher that logs every message at debug level
#[derive(Debug, Default, Clone)]
pub struct LoggingDispatcher;

impl LoggingDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageDispatcher for LoggingDispatcher {
    async fn dispatch(&self, topic: &str, payload: &str) -> Result<(), DispatchError> {
        debug!(
            topic = %topic,
            content = %payload,
            "Message dispatched"
        );
        Ok(())
    }
}

/// Per-connection adapter that tags failures with the originating broker
#[derive(Clone)]
pub struct BrokerDispatcher {
    broker_id: BrokerId,
    inner: Arc<dyn MessageDispatcher>,
}

impl BrokerDispatcher {
    pub fn new(broker_id: BrokerId, inner: Arc<dyn MessageDispatcher>) -> Self {
        Self { broker_id, inner }
    }
}

#[async_trait]
impl MessageDispatcher for BrokerDispatcher {
    async fn dispatch(&self, topic: &str, payload: &str) -> Result<(), DispatchError> {
        self.inner
            .dispatch(topic, payload)
            .await
            .map_err(|e| {
                DispatchError::new(topic, format!("broker {}: {}", self.broker_id, e.message))
            })
    }
}
