use crate::domain::{MqttConfig, TransportMode};
use crate::mqtt::BrokerError;
use rumqttc::{MqttOptions, Transport};

/// Build client options for the configured transport
///
/// The websocket transport takes a full `wss://host:port/path` URL in place of
/// the host; the port argument is then ignored by the client.
pub fn build_mqtt_options(config: &MqttConfig) -> Result<MqttOptions, BrokerError> {
    config
        .validate()
        .map_err(|e| BrokerError::InvalidOptions(e.to_string()))?;

    let port = config.port();
    let (broker_addr, transport) = match config.transport {
        TransportMode::Plain => (config.host.clone(), Transport::tcp()),
        TransportMode::Tls => (config.host.clone(), Transport::tls_with_default_config()),
        TransportMode::Wss => (
            format!("wss://{}:{}{}", config.host, port, config.websocket_path),
            Transport::wss_with_default_config(),
        ),
    };

    let mut options = MqttOptions::new(config.client_id.clone(), broker_addr, port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
    options.set_transport(transport);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    Ok(options)
}
