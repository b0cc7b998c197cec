use crate::aggregator::LockingStrategy;
use pixora_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Fatal startup errors; nothing is built until configuration resolves
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Unknown {setting} '{value}'")]
    UnknownBackend {
        setting: &'static str,
        value: String,
    },

    #[error("Missing required setting {0}")]
    MissingSetting(&'static str),

    #[error("Invalid Kafka configuration: {0}")]
    Kafka(#[from] pixora_pipeline::ConfigError),
}

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka settings shared with the pipeline crate
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engagement: EngagementConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port of the Prometheus scrape endpoint
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// kafka or memory
    #[serde(default = "default_broker")]
    pub broker: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// s3, minio or memory
    #[serde(default = "default_blob_backend")]
    pub blob_backend: String,
    /// postgres or memory
    #[serde(default = "default_postgres")]
    pub metadata_backend: String,
    /// Upper bound on any single blob or metadata call
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (always on for the minio backend)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static credentials; the default AWS provider chain is used when unset
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Room left in a broker message for the JSON envelope around the image data
const ENVELOPE_OVERHEAD_BYTES: usize = 4 * 1024;

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// How long startup waits for a pooled connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connections above `min_connections` close after this
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngagementConfig {
    /// postgres or memory
    #[serde(default = "default_postgres")]
    pub store: String,
    /// row_locking, enhanced_list or combined
    #[serde(default = "default_locking_strategy")]
    pub locking_strategy: String,
    /// How long a writer waits for a target's row lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "pixora-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_broker() -> String {
    "kafka".to_string()
}

fn default_blob_backend() -> String {
    "s3".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_locking_strategy() -> String {
    "row_locking".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_backend: default_blob_backend(),
            metadata_backend: default_postgres(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            store: default_postgres(),
            locking_strategy: default_locking_strategy(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Kafka,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBackendKind {
    S3,
    /// S3 protocol against a MinIO endpoint, path-style addressing
    Minio,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackendKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementStoreKind {
    Postgres,
    Memory,
}

/// Every backend choice, resolved once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backends {
    /// Where events are published and consumed
    pub broker: BrokerKind,
    pub blob: BlobBackendKind,
    pub metadata: MetadataBackendKind,
    pub engagement_store: EngagementStoreKind,
    pub locking_strategy: LockingStrategy,
}

impl Backends {
    pub fn needs_database(&self) -> bool {
        self.metadata == MetadataBackendKind::Postgres
            || self.engagement_store == EngagementStoreKind::Postgres
    }
}

fn unknown(setting: &'static str, value: &str) -> ConfigurationError {
    ConfigurationError::UnknownBackend {
        setting,
        value: value.to_string(),
    }
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigurationError> {
        let config = config::Config::builder()
            .set_default("service.name", "pixora-storage")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/pixora").required(false))
            .add_source(config::File::with_name("/etc/pixora/pixora").required(false))
            // PIXORA__STORAGE__BLOB_BACKEND -> storage.blob_backend
            .add_source(
                config::Environment::with_prefix("PIXORA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Everything in memory: no broker, no database, no object store
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.pipeline.broker = "memory".to_string();
        config.storage.blob_backend = "memory".to_string();
        config.storage.metadata_backend = "memory".to_string();
        config.engagement.store = "memory".to_string();
        config
    }

    /// Resolve every backend string, failing before any component is built
    pub fn backends(&self) -> Result<Backends, ConfigurationError> {
        let broker = match self.pipeline.broker.to_lowercase().as_str() {
            "kafka" => BrokerKind::Kafka,
            "memory" => BrokerKind::Memory,
            other => return Err(unknown("pipeline.broker", other)),
        };

        let blob = match self.storage.blob_backend.to_lowercase().as_str() {
            "s3" => BlobBackendKind::S3,
            "minio" => BlobBackendKind::Minio,
            "memory" => BlobBackendKind::Memory,
            other => return Err(unknown("storage.blob_backend", other)),
        };

        let metadata = match self.storage.metadata_backend.to_lowercase().as_str() {
            "postgres" | "postgresql" => MetadataBackendKind::Postgres,
            "memory" => MetadataBackendKind::Memory,
            other => return Err(unknown("storage.metadata_backend", other)),
        };

        let engagement_store = match self.engagement.store.to_lowercase().as_str() {
            "postgres" | "postgresql" => EngagementStoreKind::Postgres,
            "memory" => EngagementStoreKind::Memory,
            other => return Err(unknown("engagement.store", other)),
        };

        let locking_strategy = LockingStrategy::parse(&self.engagement.locking_strategy)
            .ok_or_else(|| unknown("engagement.locking_strategy", &self.engagement.locking_strategy))?;

        let backends = Backends {
            broker,
            blob,
            metadata,
            engagement_store,
            locking_strategy,
        };

        if blob != BlobBackendKind::Memory && self.s3.bucket.is_none() {
            return Err(ConfigurationError::MissingSetting("s3.bucket"));
        }
        if blob == BlobBackendKind::Minio && self.s3.endpoint_url.is_none() {
            return Err(ConfigurationError::MissingSetting("s3.endpoint_url"));
        }
        if backends.needs_database() && self.database.url.is_none() {
            return Err(ConfigurationError::MissingSetting("database.url"));
        }
        if broker == BrokerKind::Kafka {
            self.kafka.validate()?;
        }

        Ok(backends)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.operation_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.engagement.lock_timeout_ms)
    }

    /// Largest image body the API accepts: whatever still fits in one
    /// broker message once base64-encoded inside the event envelope
    pub fn upload_body_limit(&self) -> usize {
        (self.kafka.producer.max_message_bytes / 4 * 3).saturating_sub(ENVELOPE_OVERHEAD_BYTES)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_overrides(pairs: &[(&str, &str)]) -> Config {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap().try_deserialize().unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.storage.blob_backend, "s3");
        assert_eq!(config.engagement.locking_strategy, "row_locking");
        assert_eq!(config.operation_timeout(), Duration::from_secs(10));
        assert_eq!(config.kafka.consumer.group_id, "pixora-storage");
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(config.database.connect_timeout_secs));
    }

    #[test]
    fn test_upload_body_limit_follows_broker_message_size() {
        let mut config = Config::default();
        // 10 MiB messages leave room for 7.5 MiB of raw image
        assert_eq!(config.upload_body_limit(), 7_864_320 - 4096);
        assert!(config.upload_body_limit() > 2 * 1024 * 1024);

        config.kafka.producer.max_message_bytes = 1024;
        assert_eq!(config.upload_body_limit(), 0);
    }

    #[test]
    fn test_in_memory_resolves_without_settings() {
        let backends = Config::in_memory().backends().unwrap();
        assert_eq!(backends.broker, BrokerKind::Memory);
        assert_eq!(backends.blob, BlobBackendKind::Memory);
        assert_eq!(backends.locking_strategy, LockingStrategy::RowLocking);
        assert!(!backends.needs_database());
    }

    #[test]
    fn test_unknown_backend_fails_fast() {
        let mut config = Config::in_memory();
        config.storage.blob_backend = "floppy".to_string();

        match config.backends() {
            Err(ConfigurationError::UnknownBackend { setting, value }) => {
                assert_eq!(setting, "storage.blob_backend");
                assert_eq!(value, "floppy");
            }
            other => panic!("expected UnknownBackend, got {other:?}"),
        }
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let mut config = Config::in_memory();
        config.engagement.store = "postgres".to_string();
        assert!(matches!(
            config.backends(),
            Err(ConfigurationError::MissingSetting("database.url"))
        ));

        config.database.url = Some("postgres://localhost/pixora".to_string());
        assert!(config.backends().unwrap().needs_database());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = Config::in_memory();
        config.storage.blob_backend = "s3".to_string();
        assert!(matches!(
            config.backends(),
            Err(ConfigurationError::MissingSetting("s3.bucket"))
        ));
    }

    #[test]
    fn test_deserialize_nested_sections() {
        let config = from_overrides(&[
            ("pipeline.broker", "memory"),
            ("storage.blob_backend", "minio"),
            ("storage.metadata_backend", "memory"),
            ("s3.bucket", "images"),
            ("s3.endpoint_url", "http://minio:9000"),
            ("engagement.store", "memory"),
            ("engagement.locking_strategy", "combinedRowLockingEnhancedListStrategy"),
            ("kafka.topic", "images"),
        ]);

        let backends = config.backends().unwrap();
        assert_eq!(backends.blob, BlobBackendKind::Minio);
        assert_eq!(backends.locking_strategy, LockingStrategy::Combined);
        assert_eq!(config.kafka.topic, "images");
        assert_eq!(config.s3.region, "us-east-1");
    }
}
