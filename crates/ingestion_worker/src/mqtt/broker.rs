use crate::domain::TransportMode;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// A message received on the subscribed topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("broker handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("subscription to '{0}' was rejected")]
    SubscribeRejected(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("invalid client options: {0}")]
    InvalidOptions(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrokerError {
    /// Transport errors are retried with exponential backoff; everything else
    /// waits the fixed unexpected-error delay
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            BrokerError::InvalidOptions(_) | BrokerError::Unexpected(_)
        )
    }
}

/// Opens subscribed broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect, complete the handshake and subscribe to the topic filter
    ///
    /// Returns only once the subscription has been acknowledged.
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BrokerError>;

    fn transport_mode(&self) -> TransportMode;
}

/// A live, subscribed broker connection
#[async_trait]
pub trait BrokerSession: Send {
    /// Wait for the next published message
    ///
    /// An error means the connection is gone and the session must be dropped.
    async fn next_message(&mut self) -> Result<InboundMessage, BrokerError>;

    /// Best-effort clean disconnect
    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(BrokerError::Connect("refused".to_string()).is_transport());
        assert!(BrokerError::HandshakeTimeout(Duration::from_secs(30)).is_transport());
        assert!(BrokerError::SubscribeRejected("aqms/#".to_string()).is_transport());
        assert!(BrokerError::ConnectionLost("reset".to_string()).is_transport());
        assert!(!BrokerError::InvalidOptions("client id".to_string()).is_transport());
        assert!(!BrokerError::Unexpected("panic".to_string()).is_transport());
    }
}
