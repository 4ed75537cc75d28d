use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{CtasError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows buffered for one partition key before it is flushed.
    pub writer_max_buffered_rows_per_partition: usize,
    /// Estimated bytes buffered for one partition key before it is flushed.
    pub writer_max_buffered_bytes_per_partition: usize,
    /// Rows buffered across all keys of one task before the largest buffer is flushed.
    pub writer_max_buffered_rows_total: usize,
    /// Max attempts before a writer task is terminally failed.
    pub max_task_attempts: u32,
    /// Base retry backoff in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Consecutive task failures before a worker stops receiving tasks.
    pub blacklist_failure_threshold: u32,
    /// Root directory under which CTAS tables are created.
    pub warehouse_dir: String,
    /// Optional JSON catalog file.
    pub catalog_path: Option<String>,
    /// Remove partial table output when the write stage fails.
    pub cleanup_failed_output: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            writer_max_buffered_rows_per_partition: 8192,
            writer_max_buffered_bytes_per_partition: 16 * 1024 * 1024,
            writer_max_buffered_rows_total: 256 * 1024,
            max_task_attempts: 3,
            retry_backoff_base_ms: 250,
            blacklist_failure_threshold: 3,
            warehouse_dir: "./ctas_warehouse".to_string(),
            catalog_path: None,
            cleanup_failed_output: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `CTAS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("CTAS_WRITER_MAX_BUFFERED_ROWS")? {
            cfg.writer_max_buffered_rows_per_partition = v;
        }
        if let Some(v) = env_parse::<usize>("CTAS_WRITER_MAX_BUFFERED_BYTES")? {
            cfg.writer_max_buffered_bytes_per_partition = v;
        }
        if let Some(v) = env_parse::<usize>("CTAS_WRITER_MAX_BUFFERED_ROWS_TOTAL")? {
            cfg.writer_max_buffered_rows_total = v;
        }
        if let Some(v) = env_parse::<u32>("CTAS_MAX_TASK_ATTEMPTS")? {
            cfg.max_task_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("CTAS_RETRY_BACKOFF_BASE_MS")? {
            cfg.retry_backoff_base_ms = v;
        }
        if let Some(v) = env_parse::<u32>("CTAS_BLACKLIST_FAILURE_THRESHOLD")? {
            cfg.blacklist_failure_threshold = v;
        }
        if let Ok(v) = env::var("CTAS_WAREHOUSE_DIR") {
            cfg.warehouse_dir = v;
        }
        if let Ok(v) = env::var("CTAS_CATALOG_PATH") {
            cfg.catalog_path = Some(v);
        }
        if let Some(v) = env_parse::<bool>("CTAS_CLEANUP_FAILED_OUTPUT")? {
            cfg.cleanup_failed_output = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would make the write stage unable to progress.
    pub fn validate(&self) -> Result<()> {
        if self.writer_max_buffered_rows_per_partition == 0 {
            return Err(CtasError::InvalidConfig(
                "writer_max_buffered_rows_per_partition must be > 0".to_string(),
            ));
        }
        if self.writer_max_buffered_rows_total == 0 {
            return Err(CtasError::InvalidConfig(
                "writer_max_buffered_rows_total must be > 0".to_string(),
            ));
        }
        if self.max_task_attempts == 0 {
            return Err(CtasError::InvalidConfig(
                "max_task_attempts must be >= 1".to_string(),
            ));
        }
        if self.warehouse_dir.trim().is_empty() {
            return Err(CtasError::InvalidConfig(
                "warehouse_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CtasError::InvalidConfig(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().expect("valid defaults");
    }

    #[test]
    fn rejects_zero_attempts() {
        let cfg = EngineConfig {
            max_task_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
