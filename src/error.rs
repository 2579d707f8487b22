//! Error types for pool operations
//!
//! Connect failures are not errors here: they are reported as a
//! [`ConnectResult`](crate::pool::ConnectResult) and recovery stays with the
//! connection. `PoolError` covers what a caller must react to.

use crate::broker::BrokerId;
use crate::config::ConfigError;
use crate::pool::ConnectionError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No connection for broker {0}")]
    NotFound(BrokerId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection task for broker {0} is no longer running")]
    ConnectionClosed(BrokerId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PoolError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::NotFound(_))
    }
}

impl From<ConnectionError> for PoolError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Closed(broker_id) => PoolError::ConnectionClosed(broker_id),
            ConnectionError::Transport(e) => PoolError::Transport(e),
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_connection_error_mapping() {
        let id = Uuid::new_v4();

        let closed = PoolError::from(ConnectionError::Closed(id));
        assert!(matches!(closed, PoolError::ConnectionClosed(found) if found == id));

        let transport = PoolError::from(ConnectionError::Transport(TransportError::NotConnected));
        assert!(matches!(
            transport,
            PoolError::Transport(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_not_found_display() {
        let id = Uuid::nil();
        let error = PoolError::NotFound(id);

        assert!(error.is_not_found());
        assert_eq!(
            error.to_string(),
            "No connection for broker 00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let error = PoolError::from(ConfigError::InvalidConfig("bad port".to_string()));
        assert!(!error.is_not_found());
        assert!(error.to_string().contains("bad port"));
    }
}
