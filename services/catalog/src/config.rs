use darkroom_pipeline::{ConfigError, ConsumerSettings, QueueSettings, RetryPolicy};
use serde::Deserialize;

/// Main configuration for the catalog service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Upload topic configuration
    #[serde(default)]
    pub topic: TopicConfig,
    /// Ingest queue and consumer configuration
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Dead-letter queue and consumer configuration
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    /// Catalog table configuration
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Object store configuration
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// Outbound mail configuration
    #[serde(default)]
    pub mail: MailConfig,
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
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Upload topic configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Topic name for upload and metadata notifications
    #[serde(default = "default_topic_name")]
    pub name: String,
    /// Metadata kinds accepted by the metadata updater subscription
    #[serde(default = "default_metadata_types")]
    pub metadata_types: Vec<String>,
}

/// Ingest queue and consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Queue name receiving upload notifications
    #[serde(default = "default_ingest_queue")]
    pub queue_name: String,
    /// Maximum messages per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wait for the first message of a batch, in seconds
    #[serde(default = "default_batch_window_secs")]
    pub batch_window_secs: u64,
    /// Upper bound on one batch invocation, in seconds
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Concurrent batch workers
    #[serde(default = "default_ingest_concurrency")]
    pub concurrency: usize,
    /// How long a delivered message stays invisible, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Delivery attempts before dead-lettering
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
}

/// Dead-letter queue and consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    /// Queue name receiving failed upload notifications
    #[serde(default = "default_dead_letter_queue")]
    pub queue_name: String,
    /// Drop dead letters older than this, in seconds
    #[serde(default = "default_dead_letter_retention_secs")]
    pub retention_secs: u64,
    /// Maximum messages per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wait for the first message of a batch, in seconds
    #[serde(default = "default_batch_window_secs")]
    pub batch_window_secs: u64,
    /// Upper bound on one batch invocation, in seconds
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Concurrent batch workers
    #[serde(default = "default_dead_letter_concurrency")]
    pub concurrency: usize,
    /// How long a delivered message stays invisible, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

/// Catalog table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Logical table name for logging
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStoreBackend {
    /// In-process store, used for local runs and tests
    #[default]
    Memory,
    /// S3 or an S3-compatible endpoint
    S3,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: ObjectStoreBackend,
    /// Bucket holding uploaded images
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Outbound mail configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Sender address, must be set before startup
    #[serde(default)]
    pub sender: String,
    /// Recipient address, must be set before startup
    #[serde(default)]
    pub recipient: String,
    /// Subject line for upload confirmations
    #[serde(default = "default_mail_subject")]
    pub subject: String,
    /// Display name used in the mail body
    #[serde(default = "default_album_name")]
    pub album_name: String,
    /// Location prefix quoted in the mail body
    #[serde(default = "default_album_location")]
    pub album_location: String,
}

// Default value functions
fn default_service_name() -> String {
    "catalog-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_topic_name() -> String {
    "new-image".to_string()
}

fn default_metadata_types() -> Vec<String> {
    vec![
        "Caption".to_string(),
        "Date".to_string(),
        "Photographer".to_string(),
    ]
}

fn default_ingest_queue() -> String {
    "image-ingest".to_string()
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_window_secs() -> u64 {
    5
}

fn default_handler_timeout_secs() -> u64 {
    10
}

fn default_ingest_concurrency() -> usize {
    2
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_receive_count() -> u32 {
    1
}

fn default_dead_letter_queue() -> String {
    "bad-image".to_string()
}

fn default_dead_letter_retention_secs() -> u64 {
    600
}

fn default_dead_letter_concurrency() -> usize {
    1
}

fn default_table_name() -> String {
    "images".to_string()
}

fn default_bucket() -> String {
    "photo-album".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_mail_subject() -> String {
    "New image Upload".to_string()
}

fn default_album_name() -> String {
    "The Photo Album".to_string()
}

fn default_album_location() -> String {
    "s3://photo-album".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "catalog-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/catalog").required(false))
            .add_source(config::File::with_name("/etc/darkroom/catalog").required(false))
            // Override with environment variables
            // CATALOG__MAIL__SENDER -> mail.sender
            .add_source(
                config::Environment::with_prefix("CATALOG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration, failing startup on anything unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mail.sender.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "mail.sender (set CATALOG__MAIL__SENDER)".to_string(),
            ));
        }
        if self.mail.recipient.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "mail.recipient (set CATALOG__MAIL__RECIPIENT)".to_string(),
            ));
        }

        self.ingest.consumer_settings().validate()?;
        self.ingest.retry_policy().validate()?;
        self.dead_letter.consumer_settings().validate()?;
        Ok(())
    }
}

impl IngestConfig {
    /// Queue settings for the ingest queue
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout_secs: self.visibility_timeout_secs,
            retention_secs: None,
        }
    }

    /// Consumer settings for the ingest harness
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: self.batch_size,
            batch_window_secs: self.batch_window_secs,
            handler_timeout_secs: self.handler_timeout_secs,
            concurrency: self.concurrency,
        }
    }

    /// Redelivery budget before dead-lettering
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_receive_count)
    }
}

impl DeadLetterConfig {
    /// Queue settings for the dead-letter queue
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout_secs: self.visibility_timeout_secs,
            retention_secs: Some(self.retention_secs),
        }
    }

    /// Consumer settings for the dead-letter harness
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: self.batch_size,
            batch_window_secs: self.batch_window_secs,
            handler_timeout_secs: self.handler_timeout_secs,
            concurrency: self.concurrency,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            topic: TopicConfig::default(),
            ingest: IngestConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            catalog: CatalogConfig::default(),
            object_store: ObjectStoreConfig::default(),
            mail: MailConfig::default(),
        }
    }
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

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: default_topic_name(),
            metadata_types: default_metadata_types(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_name: default_ingest_queue(),
            batch_size: default_batch_size(),
            batch_window_secs: default_batch_window_secs(),
            handler_timeout_secs: default_handler_timeout_secs(),
            concurrency: default_ingest_concurrency(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
        }
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            queue_name: default_dead_letter_queue(),
            retention_secs: default_dead_letter_retention_secs(),
            batch_size: default_batch_size(),
            batch_window_secs: default_batch_window_secs(),
            handler_timeout_secs: default_handler_timeout_secs(),
            concurrency: default_dead_letter_concurrency(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: ObjectStoreBackend::default(),
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sender: String::new(),
            recipient: String::new(),
            subject: default_mail_subject(),
            album_name: default_album_name(),
            album_location: default_album_location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured_mail() -> MailConfig {
        MailConfig {
            sender: "album@example.com".to_string(),
            recipient: "curator@example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_values() {
        let config = Config {
            mail: configured_mail(),
            ..Default::default()
        };

        assert_eq!(config.topic.name, "new-image");
        assert_eq!(config.ingest.batch_size, 5);
        assert_eq!(config.ingest.max_receive_count, 1);
        assert_eq!(config.dead_letter.retention_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_mail_addresses_fail_validation() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ingest_settings_conversion() {
        let ingest = IngestConfig::default();
        assert_eq!(ingest.queue_settings().visibility_timeout_secs, 30);
        assert_eq!(ingest.consumer_settings().batch_size, 5);
        assert!(ingest.retry_policy().attempts_exhausted(1));
    }

    #[test]
    fn test_dead_letter_queue_has_retention() {
        let dead_letter = DeadLetterConfig::default();
        assert_eq!(dead_letter.queue_settings().retention_secs, Some(600));
    }
}
