//! Configuration for elohim-curriculum

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::duplication::DEFAULT_MAX_DEPTH;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-curriculum")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for the database and blobs
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Blob directory name inside `storage_dir`
    #[serde(default = "default_blobs_subdir")]
    pub blobs_subdir: String,

    #[serde(default)]
    pub duplication: DuplicationConfig,

    #[serde(default)]
    pub attachments: AttachmentConfig,
}

/// Duplication worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicationConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Attempts per job before it is dead-lettered
    #[serde(default = "default_job_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    #[serde(default = "default_job_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_job_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Hierarchy depth ceiling (root is depth 0)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// How often `serve` looks for jobs submitted by other processes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Attachment copier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    #[serde(default = "default_max_concurrent_copies")]
    pub max_concurrent_copies: usize,

    /// Attempts per blob before the owning row is flagged broken
    #[serde(default = "default_attachment_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_attachment_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_attachment_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Tasks fetched per copier round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Retry budget and exponential backoff shared by jobs and attachment copies
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Same backoff curve with a different attempt budget (jobs carry their own).
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    /// Delay before retrying after a failure on `attempt` (1-based), or `None`
    /// when the failure is terminal or the budget is spent.
    pub fn next_retry(&self, attempt: u32, retryable: bool) -> Option<Duration> {
        if !retryable || attempt >= self.max_attempts {
            return None;
        }
        Some(self.delay_after(attempt))
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let cap = self.max_backoff_ms as f64;
        let mut delay_ms = self.initial_backoff_ms as f64;
        for _ in 1..attempt {
            if delay_ms >= cap {
                break;
            }
            delay_ms *= self.backoff_multiplier;
        }
        Duration::from_millis(delay_ms.min(cap) as u64)
    }
}

fn default_database_file() -> String {
    "curriculum.db".to_string()
}

fn default_blobs_subdir() -> String {
    "blobs".to_string()
}

fn default_worker_count() -> usize {
    2
}

fn default_job_attempts() -> u32 {
    5
}

fn default_attempt_timeout() -> u64 {
    120
}

fn default_job_initial_backoff() -> u64 {
    500
}

fn default_job_max_backoff() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_concurrent_copies() -> usize {
    8
}

fn default_attachment_attempts() -> u32 {
    4
}

fn default_attachment_initial_backoff() -> u64 {
    1000
}

fn default_attachment_max_backoff() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    64
}

impl Default for DuplicationConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_attempts: default_job_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            initial_backoff_ms: default_job_initial_backoff(),
            max_backoff_ms: default_job_max_backoff(),
            backoff_multiplier: default_multiplier(),
            max_depth: default_max_depth(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl DuplicationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff_ms: self.initial_backoff_ms,
            backoff_multiplier: self.backoff_multiplier,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_copies: default_max_concurrent_copies(),
            max_attempts: default_attachment_attempts(),
            initial_backoff_ms: default_attachment_initial_backoff(),
            max_backoff_ms: default_attachment_max_backoff(),
            backoff_multiplier: default_multiplier(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl AttachmentConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff_ms: self.initial_backoff_ms,
            backoff_multiplier: self.backoff_multiplier,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            blobs_subdir: default_blobs_subdir(),
            duplication: DuplicationConfig::default(),
            attachments: AttachmentConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join(&self.blobs_subdir)
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            storage_dir = "/var/lib/elohim"

            [duplication]
            worker_count = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/elohim"));
        assert_eq!(config.duplication.worker_count, 6);
        assert_eq!(config.duplication.max_attempts, 5);
        assert_eq!(config.duplication.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.attachments.batch_size, 64);
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/elohim/curriculum.db"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.storage_dir = temp_dir.path().to_path_buf();
        config.attachments.max_attempts = 9;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.storage_dir, config.storage_dir);
        assert_eq!(loaded.attachments.max_attempts, 9);
        assert_eq!(loaded.duplication.retry_policy().max_attempts, 5);
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5000,
        }
    }

    #[test]
    fn test_retry_delay_doubles_up_to_cap() {
        let policy = policy(40);
        let delays: Vec<u64> = [1, 2, 3, 4, 30]
            .iter()
            .map(|&attempt| policy.next_retry(attempt, true).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_no_retry_when_terminal_or_exhausted() {
        let policy = policy(3);
        assert!(policy.next_retry(2, true).is_some());
        assert_eq!(policy.next_retry(3, true), None);
        assert_eq!(policy.next_retry(1, false), None);
        assert_eq!(policy.with_max_attempts(1).next_retry(1, true), None);
        assert_eq!(Config::default().attachments.retry_policy().max_attempts, 4);
    }
}
