use anyhow::{Context, Result};
use common::postgres::PostgresConfig;
use config::{Config, ConfigError, Environment};
use ingestion_worker::domain::{
    BackoffConfig, IngestionConfig, MqttConfig, NormalizerConfig, TransportMode,
    DEFAULT_MAX_PACKET_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const REDACTED: &str = "***";

/// Where normalized readings are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Postgres,
    Memory,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "memory" | "in_memory" | "in-memory" => Ok(Self::Memory),
            other => Err(format!(
                "unknown sink '{}', expected: postgres, memory",
                other
            )),
        }
    }
}

/// Service settings, read from `AQMS_*` environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // MQTT configuration
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    /// Broker port; unset uses 1883, 8883 or 443 depending on the mode
    #[serde(default)]
    pub mqtt_port: Option<u16>,

    #[serde(default)]
    pub mqtt_username: Option<String>,

    #[serde(default)]
    pub mqtt_password: Option<String>,

    /// Transport: plain, tls or wss
    #[serde(default = "default_mqtt_mode")]
    pub mqtt_mode: String,

    /// Topic filter to subscribe to
    #[serde(default = "default_mqtt_topic")]
    pub mqtt_topic: String,

    /// Client ID; unset derives one from the process ID
    #[serde(default)]
    pub mqtt_client_id: Option<String>,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// Time allowed for CONNACK and SUBACK
    #[serde(default = "default_mqtt_connect_timeout_secs")]
    pub mqtt_connect_timeout_secs: u64,

    #[serde(default = "default_mqtt_websocket_path")]
    pub mqtt_websocket_path: String,

    /// Largest MQTT packet accepted or sent, in bytes
    #[serde(default = "default_mqtt_max_packet_size")]
    pub mqtt_max_packet_size: usize,

    // Reconnect configuration
    #[serde(default = "default_backoff_min_secs")]
    pub backoff_min_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_unexpected_error_delay_secs")]
    pub unexpected_error_delay_secs: u64,

    /// How long shutdown waits for the ingestion task
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Log skipped payloads and per-message store summaries at info/warn
    #[serde(default)]
    pub debug: bool,

    /// Reading sink: postgres or memory
    #[serde(default = "default_sink")]
    pub sink: String,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    // OpenTelemetry configuration
    #[serde(default)]
    pub otel_enabled: bool,

    /// OTLP gRPC endpoint
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_mode() -> String {
    "tls".to_string()
}

fn default_mqtt_topic() -> String {
    "aqms/#".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    60
}

fn default_mqtt_connect_timeout_secs() -> u64 {
    30
}

fn default_mqtt_websocket_path() -> String {
    "/mqtt".to_string()
}

fn default_mqtt_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_backoff_min_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    30
}

fn default_unexpected_error_delay_secs() -> u64 {
    3
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_sink() -> String {
    "postgres".to_string()
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "aqms".to_string()
}

fn default_postgres_username() -> String {
    "aqms".to_string()
}

fn default_postgres_password() -> String {
    "aqms".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    10
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "aqms-ingest".to_string()
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("AQMS"))
            .build()?
            .try_deserialize()
    }

    pub fn sink_kind(&self) -> Result<SinkKind> {
        self.sink
            .parse::<SinkKind>()
            .map_err(anyhow::Error::msg)
            .context("invalid AQMS_SINK")
    }

    pub fn ingestion_config(&self) -> Result<IngestionConfig> {
        let transport = self
            .mqtt_mode
            .parse::<TransportMode>()
            .map_err(anyhow::Error::msg)
            .context("invalid AQMS_MQTT_MODE")?;

        let defaults = MqttConfig::default();
        let mqtt = MqttConfig {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            transport,
            username: self.mqtt_username.clone().filter(|u| !u.is_empty()),
            password: self.mqtt_password.clone().filter(|p| !p.is_empty()),
            topic_filter: self.mqtt_topic.clone(),
            client_id: self
                .mqtt_client_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or(defaults.client_id),
            keep_alive_secs: self.mqtt_keep_alive_secs,
            connect_timeout_secs: self.mqtt_connect_timeout_secs,
            websocket_path: self.mqtt_websocket_path.clone(),
            max_packet_size: self.mqtt_max_packet_size,
        };
        mqtt.validate()?;

        let backoff = BackoffConfig {
            min_delay_ms: self.backoff_min_secs.saturating_mul(1000),
            max_delay_ms: self.backoff_max_secs.saturating_mul(1000),
            unexpected_error_delay_ms: self.unexpected_error_delay_secs.saturating_mul(1000),
        };
        backoff
            .validate()
            .context("invalid AQMS_BACKOFF_* settings")?;

        Ok(IngestionConfig {
            mqtt,
            backoff,
            normalizer: NormalizerConfig {
                verbose: self.debug,
                ..Default::default()
            },
            stop_timeout_ms: self.stop_timeout_secs.saturating_mul(1000),
        })
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_max_pool_size,
        }
    }

    /// Copy safe to log: credentials are masked
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.mqtt_password.is_some() {
            config.mqtt_password = Some(REDACTED.to_string());
        }
        config.postgres_password = REDACTED.to_string();
        config
    }
}
