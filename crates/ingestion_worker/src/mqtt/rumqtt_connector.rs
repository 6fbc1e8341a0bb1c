use crate::domain::{MqttConfig, TransportMode};
use crate::mqtt::{build_mqtt_options, BrokerConnector, BrokerError, BrokerSession, InboundMessage};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// `BrokerConnector` backed by the rumqttc async client
pub struct RumqttConnector {
    config: MqttConfig,
}

impl RumqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    #[instrument(
        name = "mqtt_connect",
        skip_all,
        fields(
            host = %self.config.host,
            port = self.config.port(),
            transport = %self.config.transport,
            topic = %self.config.topic_filter,
        )
    )]
    async fn open_session(&self) -> Result<RumqttSession, BrokerError> {
        let options = build_mqtt_options(&self.config)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        client
            .subscribe(&self.config.topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Unexpected(format!("failed to queue subscribe: {}", e)))?;

        let timeout = self.config.connect_timeout();
        let pending = tokio::time::timeout(
            timeout,
            wait_for_subscription(&mut eventloop, &self.config.topic_filter),
        )
        .await
        .map_err(|_| BrokerError::HandshakeTimeout(timeout))??;

        info!(topic = %self.config.topic_filter, "subscribed to MQTT topic");

        Ok(RumqttSession {
            client,
            eventloop,
            pending,
        })
    }
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let session = self.open_session().await?;
        Ok(Box::new(session))
    }

    fn transport_mode(&self) -> TransportMode {
        self.config.transport
    }
}

/// Poll until the broker acknowledges the subscription
///
/// Publishes that arrive before the SUBACK (retained messages, persistent
/// sessions) are buffered and handed out first by the session.
async fn wait_for_subscription(
    eventloop: &mut EventLoop,
    topic_filter: &str,
) -> Result<VecDeque<InboundMessage>, BrokerError> {
    let mut pending = VecDeque::new();

    loop {
        let event = eventloop
            .poll()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                debug!("connected to MQTT broker");
            }
            Event::Incoming(Packet::SubAck(suback)) => {
                if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(BrokerError::SubscribeRejected(topic_filter.to_string()));
                }
                return Ok(pending);
            }
            Event::Incoming(Packet::Publish(publish)) => {
                pending.push_back(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Event::Incoming(Packet::Disconnect) => {
                return Err(BrokerError::Connect(
                    "broker closed the connection during handshake".to_string(),
                ));
            }
            _ => {}
        }
    }
}

/// A subscribed rumqttc connection
///
/// Dropping the session drops the event loop, which closes the socket.
pub struct RumqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    pending: VecDeque<InboundMessage>,
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn next_message(&mut self) -> Result<InboundMessage, BrokerError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(BrokerError::ConnectionLost(
                        "broker sent DISCONNECT".to_string(),
                    ));
                }
                Ok(_) => {
                    // Pings, acks and outgoing packets
                }
                Err(e) => return Err(BrokerError::ConnectionLost(e.to_string())),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "failed to queue MQTT disconnect");
            return;
        }

        // The request only leaves once the event loop is polled
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("timed out flushing MQTT disconnect");
        }
    }
}
