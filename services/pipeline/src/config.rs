//! Kafka configuration for the Pixora event pipeline.
//!
//! One logical topic carries every lifecycle and engagement event. The same
//! [`KafkaConfig`] feeds the producer used on the request path and the
//! consumer that drives the storage dispatcher.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while assembling Kafka settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for broker connections
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            "sasl_plaintext" => Ok(SecurityProtocol::SaslPlaintext),
            "sasl_ssl" => Ok(SecurityProtocol::SaslSsl),
            other => Err(ConfigError::InvalidValue {
                key: "security_protocol".to_string(),
                message: format!("unknown protocol '{other}'"),
            }),
        }
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Credentials and certificates for secured clusters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub protocol: SecurityProtocol,
    #[serde(default)]
    pub sasl_mechanism: SaslMechanism,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Path to CA certificate file
    pub ssl_ca_location: Option<String>,
}

/// Producer-side delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Time the request path waits for a broker acknowledgment
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    /// Upper bound on a single event (uploads carry the image bytes)
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

/// Consumer-side group settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

fn default_fetch_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_group_id() -> String {
    "pixora-storage".to_string()
}

fn default_client_id() -> String {
    "pixora".to_string()
}

fn default_topic() -> String {
    "pixora.image-events".to_string()
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: default_publish_timeout_ms(),
            acks: default_acks(),
            enable_idempotence: true,
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
            fetch_max_bytes: default_fetch_max_bytes(),
        }
    }
}

/// Kafka settings shared by the producer and the consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic carrying every pipeline event
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Raw librdkafka properties applied last
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            topic: default_topic(),
            security: SecurityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `KAFKA_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            std::env::var("KAFKA_BOOTSTRAP_SERVERS").unwrap_or_else(|_| default_bootstrap_servers()),
        );

        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(topic) = std::env::var("KAFKA_TOPIC") {
            config.topic = topic;
        }
        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            config.security.protocol = SecurityProtocol::parse(&protocol)?;
        }
        if let Ok(username) = std::env::var("KAFKA_SASL_USERNAME") {
            config.security.sasl_username = Some(username);
        }
        if let Ok(password) = std::env::var("KAFKA_SASL_PASSWORD") {
            config.security.sasl_password = Some(password);
        }
        if let Ok(ca) = std::env::var("KAFKA_SSL_CA_LOCATION") {
            config.security.ssl_ca_location = Some(ca);
        }

        config.validate()?;
        Ok(config)
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", self.security.protocol.as_str());

        if let Some(ref ca) = self.security.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        if self.security.protocol.uses_sasl() {
            config.set("sasl.mechanism", self.security.sasl_mechanism.as_str());
            if let Some(ref username) = self.security.sasl_username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.security.sasl_password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build the rdkafka producer configuration
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        // message.timeout.ms bounds how long a publish may wait on an
        // unreachable broker before failing back to the caller
        config
            .set("acks", &self.producer.acks)
            .set("message.timeout.ms", self.producer.publish_timeout_ms.to_string())
            .set("linger.ms", self.producer.linger_ms.to_string())
            .set("compression.type", &self.producer.compression_type)
            .set("message.max.bytes", self.producer.max_message_bytes.to_string());

        if self.producer.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        config
    }

    /// Build the rdkafka consumer configuration
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config
            .set("group.id", &self.consumer.group_id)
            .set("auto.offset.reset", &self.consumer.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.consumer.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", self.consumer.max_poll_interval_ms.to_string())
            .set("fetch.max.bytes", self.consumer.fetch_max_bytes.to_string());

        config
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.publish_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::MissingRequired("topic".to_string()));
        }
        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id".to_string()));
        }
        if self.security.protocol.uses_sasl() && self.security.sasl_username.is_none() {
            return Err(ConfigError::MissingRequired(
                "security.sasl_username (required for SASL)".to_string(),
            ));
        }
        if self.producer.publish_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "producer.publish_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert_eq!(config.topic, "pixora.image-events");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_producer_config_build() {
        let config = KafkaConfig::new("broker:9092");
        let producer_config = config.build_producer_config();

        assert_eq!(producer_config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(producer_config.get("acks"), Some("all"));
        assert_eq!(producer_config.get("message.timeout.ms"), Some("5000"));
        assert!(producer_config.get("sasl.mechanism").is_none());
    }

    #[test]
    fn test_consumer_config_never_auto_commits() {
        let config = KafkaConfig::new("broker:9092");
        let consumer_config = config.build_consumer_config();

        assert_eq!(consumer_config.get("group.id"), Some("pixora-storage"));
        assert_eq!(consumer_config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_sasl_requires_username() {
        let mut config = KafkaConfig::default();
        config.security.protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired(_))));

        config.security.sasl_username = Some("pixora".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.build_producer_config().get("sasl.mechanism"), Some("PLAIN"));
    }

    #[test]
    fn test_empty_topic_rejected() {
        let mut config = KafkaConfig::default();
        config.topic = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_security_protocol() {
        assert!(SecurityProtocol::parse("SSL").is_ok());
        assert!(SecurityProtocol::parse("carrier-pigeon").is_err());
    }
}
