mod backoff;
mod broker;
mod connection_manager;
mod rumqtt_connector;
mod transport;

pub use backoff::Backoff;
pub use broker::{BrokerConnector, BrokerError, BrokerSession, InboundMessage};
pub use connection_manager::{ConnectionManager, ConnectionState};
pub use rumqtt_connector::RumqttConnector;
pub use transport::build_mqtt_options;
