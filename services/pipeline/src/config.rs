//! Delivery settings for queues and batch consumers.
//!
//! These structures deserialize from the service configuration tree and carry
//! the tuning knobs for the delivery guarantees: visibility, retention, batch
//! shape, and the redelivery budget.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// How long a delivered message stays invisible before it is offered
    /// again, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Drop queued messages older than this, in seconds; unset keeps them
    /// indefinitely
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            retention_secs: None,
        }
    }
}

impl QueueSettings {
    /// Get the visibility timeout as Duration
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Get the retention limit as Duration
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

/// Batch consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Maximum messages handed to the handler per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long to wait for the first message of a batch, in seconds
    #[serde(default = "default_batch_window_secs")]
    pub batch_window_secs: u64,
    /// Upper bound on one batch invocation, in seconds
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Number of concurrent batch workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
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

fn default_concurrency() -> usize {
    2
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_window_secs: default_batch_window_secs(),
            handler_timeout_secs: default_handler_timeout_secs(),
            concurrency: default_concurrency(),
        }
    }
}

impl ConsumerSettings {
    /// Get the batch window as Duration
    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_secs)
    }

    /// Get the handler timeout as Duration
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// How many delivery attempts a message gets before it is given up on.
///
/// The consumer harness evaluates this after every failed attempt; a message
/// whose receive count has reached the budget is redirected to the dead-letter
/// queue instead of being returned for another try.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delivery attempts before dead-lettering
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
}

fn default_max_receive_count() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_receive_count: default_max_receive_count(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_receive_count: u32) -> Self {
        Self { max_receive_count }
    }

    /// Whether a message delivered `receive_count` times has used up its
    /// attempts
    pub fn attempts_exhausted(&self, receive_count: u32) -> bool {
        receive_count >= self.max_receive_count
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_receive_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_receive_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
