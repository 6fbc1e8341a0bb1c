use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default cap for a single MQTT packet, in bytes
///
/// Batched payloads routinely exceed the client library's 10 KiB default.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Largest packet the MQTT 3.1.1 remaining-length field can describe
pub const MQTT_MAX_PACKET_SIZE: usize = 268_435_455;

/// How the broker connection is established.
///
/// Only one transport is active per run; the choice changes the handshake
/// and nothing else.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Unencrypted TCP
    Plain,
    /// TLS using the platform trust store
    #[default]
    Tls,
    /// TLS over websocket framing
    Wss,
}

impl TransportMode {
    /// Conventional broker port for this transport
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Plain => 1883,
            Self::Tls => 8883,
            Self::Wss => 443,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Tls => write!(f, "tls"),
            Self::Wss => write!(f, "wss"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plain" | "tcp" | "mqtt" => Ok(Self::Plain),
            "tls" | "ssl" | "mqtts" => Ok(Self::Tls),
            "wss" | "websocket" | "websockets" => Ok(Self::Wss),
            other => Err(format!(
                "unknown transport mode '{}', expected: plain, tls, wss",
                other
            )),
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    /// Broker port; `None` uses the transport's conventional port
    pub port: Option<u16>,

    pub transport: TransportMode,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Topic filter to subscribe to, e.g. `aqms/+/data`
    pub topic_filter: String,

    pub client_id: String,

    pub keep_alive_secs: u64,

    /// Upper bound for CONNACK + SUBACK after opening the connection
    pub connect_timeout_secs: u64,

    /// Request path used by the websocket transport
    pub websocket_path: String,

    /// Largest packet accepted from or sent to the broker, in bytes
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            transport: TransportMode::default(),
            username: None,
            password: None,
            topic_filter: "aqms/#".to_string(),
            client_id: format!("aqms-ingest-{}", std::process::id()),
            keep_alive_secs: 60,
            connect_timeout_secs: 30,
            websocket_path: "/mqtt".to_string(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl MqttConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reject settings the MQTT client would refuse at connect time
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("MQTT host cannot be empty");
        }
        if self.topic_filter.trim().is_empty() {
            bail!("MQTT topic filter cannot be empty");
        }
        if self.client_id.is_empty() || self.client_id.starts_with(' ') {
            bail!("MQTT client ID cannot be empty or start with a space");
        }
        if self.keep_alive_secs == 0 {
            bail!("MQTT keep alive must be at least 1 second");
        }
        if self.connect_timeout_secs == 0 {
            bail!("MQTT connect timeout must be at least 1 second");
        }
        if self.max_packet_size == 0 || self.max_packet_size > MQTT_MAX_PACKET_SIZE {
            bail!(
                "MQTT max packet size must be between 1 and {} bytes, got {}",
                MQTT_MAX_PACKET_SIZE,
                self.max_packet_size
            );
        }
        if self.transport == TransportMode::Wss && !self.websocket_path.starts_with('/') {
            bail!(
                "websocket path '{}' must start with '/'",
                self.websocket_path
            );
        }
        if self.password.is_some() && self.username.is_none() {
            bail!("MQTT password provided without a username");
        }
        Ok(())
    }
}

/// Reconnect delays used by the connection manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay after a failure and the value restored after a successful subscribe
    pub min_delay_ms: u64,

    /// Cap for the doubling delay
    pub max_delay_ms: u64,

    /// Fixed delay after failures that are not transport errors
    pub unexpected_error_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 30_000,
            unexpected_error_delay_ms: 3_000,
        }
    }
}

impl BackoffConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn unexpected_error_delay(&self) -> Duration {
        Duration::from_millis(self.unexpected_error_delay_ms)
    }

    /// Zero delays would turn a dead broker into a busy reconnect loop
    pub fn validate(&self) -> Result<()> {
        if self.min_delay_ms == 0 {
            bail!("backoff minimum delay must be greater than zero");
        }
        if self.unexpected_error_delay_ms == 0 {
            bail!("unexpected error delay must be greater than zero");
        }
        if self.max_delay_ms < self.min_delay_ms {
            bail!(
                "backoff maximum delay ({} ms) is below the minimum ({} ms)",
                self.max_delay_ms,
                self.min_delay_ms
            );
        }
        Ok(())
    }
}

/// Payload keys and logging detail used while normalizing messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Key holding the station identifier
    pub source_id_key: String,

    /// Canonical timestamp key
    pub timestamp_key: String,

    /// Alternate timestamp keys, checked in order when the canonical key is absent
    pub timestamp_fallback_keys: Vec<String>,

    /// Zero-based topic segment used when the payload has no station identifier
    pub topic_source_segment: usize,

    /// Maximum characters of payload echoed into log lines
    pub preview_len: usize,

    /// Log skipped and dropped messages with payload previews
    pub verbose: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            source_id_key: "uid".to_string(),
            timestamp_key: "datetime".to_string(),
            timestamp_fallback_keys: vec!["ts".to_string(), "time".to_string(), "t".to_string()],
            topic_source_segment: 1,
            preview_len: 80,
            verbose: false,
        }
    }
}

/// Everything the ingestion pipeline needs, passed in at construction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub mqtt: MqttConfig,
    pub backoff: BackoffConfig,
    pub normalizer: NormalizerConfig,

    /// How long `stop()` waits for the connection task before giving up
    pub stop_timeout_ms: u64,
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<()> {
        self.mqtt.validate()?;
        self.backoff.validate()
    }

    pub fn stop_timeout(&self) -> Duration {
        if self.stop_timeout_ms == 0 {
            Duration::from_secs(5)
        } else {
            Duration::from_millis(self.stop_timeout_ms)
        }
    }
}
