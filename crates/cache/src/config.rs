//! Configuration types for cache transfers

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest part size S3 accepts for every part but the last (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Transfer settings shared by save and restore
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    /// Single-put threshold and multipart chunk size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Maximum number of paths transferred concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// zstd compression level
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Directory for payload temporary files (system temp dir when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,

    /// Retry configuration for store requests
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            concurrency: default_concurrency(),
            compression_level: default_compression_level(),
            temp_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Directory used for temporary payload files
    #[must_use]
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Concurrency limit, never below one
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Part size, never below one byte
    #[must_use]
    pub fn effective_part_size(&self) -> u64 {
        self.part_size.max(1)
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// A configuration that makes exactly one attempt
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

// Default value functions
fn default_part_size() -> u64 {
    MIN_PART_SIZE
}

fn default_concurrency() -> usize {
    4
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.part_size, 5 * 1024 * 1024);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.compression_level, 3);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: TransferConfig =
            serde_json::from_str(r#"{"part_size": 8388608, "retry": {"max_attempts": 5}}"#)
                .unwrap();
        assert_eq!(config.part_size, 8 * 1024 * 1024);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 100);
    }

    #[test]
    fn test_effective_values_clamp() {
        let config = TransferConfig {
            part_size: 0,
            concurrency: 0,
            ..TransferConfig::default()
        };
        assert_eq!(config.effective_part_size(), 1);
        assert_eq!(config.effective_concurrency(), 1);
    }
}
