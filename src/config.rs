//! Pipeline configuration.

use crate::error::{PipelineError, Result};
use crate::queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted visibility timeout (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 12 * 60 * 60;

/// Tunables for one queued consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Deliveries before dead-lettering.
    /// Default: 3
    pub max_attempts: u32,

    /// Seconds a received message stays hidden.
    /// Default: 30
    pub visibility_timeout_secs: u64,

    /// Messages taken per receive.
    /// Default: 10
    pub batch_size: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout_secs: 30,
            batch_size: 10,
        }
    }
}

impl ConsumerConfig {
    pub fn queue_config(&self, name: impl Into<String>) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            max_attempts: self.max_attempts,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
        }
    }

    fn validate(&self, consumer: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Config(format!(
                "{consumer}: max_attempts must be at least 1"
            )));
        }
        if self.visibility_timeout_secs == 0 {
            return Err(PipelineError::Config(format!(
                "{consumer}: visibility_timeout_secs must be at least 1"
            )));
        }
        if self.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
            return Err(PipelineError::Config(format!(
                "{consumer}: visibility_timeout_secs must be at most {MAX_VISIBILITY_TIMEOUT_SECS}"
            )));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config(format!(
                "{consumer}: batch_size must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Sender and recipient for notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub from: String,
    pub to: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: "uploads@example.com".to_string(),
            to: "owner@example.com".to_string(),
        }
    }
}

/// Full pipeline configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upload queue feeding the logger.
    pub upload: ConsumerConfig,

    /// Metadata queue feeding the metadata updater.
    pub metadata: ConsumerConfig,

    /// Upload dead-letter queue feeding the rejection notifier.
    pub rejection: ConsumerConfig,

    pub mail: MailConfig,

    /// Directory for queue journals (None = in-memory queues).
    pub journal_dir: Option<PathBuf>,

    /// How long an idle worker waits before polling again.
    /// Default: 1000
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload: ConsumerConfig {
                batch_size: 5,
                ..Default::default()
            },
            metadata: ConsumerConfig::default(),
            rejection: ConsumerConfig::default(),
            mail: MailConfig::default(),
            journal_dir: None,
            poll_interval_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.upload.validate("upload")?;
        self.metadata.validate("metadata")?;
        self.rejection.validate("rejection")?;
        if self.mail.to.trim().is_empty() {
            return Err(PipelineError::Config("mail.to must not be empty".into()));
        }
        if self.mail.from.trim().is_empty() {
            return Err(PipelineError::Config("mail.from must not be empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
