//! Hierarchical configuration loading.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid queue.max_concurrent: {0}. Must be at least 1")]
    InvalidMaxConcurrent(usize),

    #[error("Invalid queue.memory_watermark_bytes: must be positive")]
    InvalidWatermark,

    #[error("Invalid adaptive windows: stall ({0}ms) must be below hang ({1}ms)")]
    InvalidAdaptiveWindows(u64, u64),

    #[error("Invalid gateway.rate_limit_rps: {0}. Must be positive")]
    InvalidRateLimit(f64),

    #[error("Invalid stream buffer: backpressure threshold {0} must be below capacity {1}")]
    InvalidStreamBuffer(usize, usize),

    #[error("Analytics database path cannot be empty")]
    EmptyAnalyticsPath,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.nexus/config.yaml` (project config)
    /// 3. `.nexus/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`NEXUS_*` prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".nexus/config.yaml"))
            .merge(Yaml::file(".nexus/local.yaml"))
            .merge(Env::prefixed("NEXUS_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.queue.max_concurrent == 0 {
            return Err(ConfigError::InvalidMaxConcurrent(config.queue.max_concurrent));
        }
        if config.queue.memory_watermark_bytes == 0 {
            return Err(ConfigError::InvalidWatermark);
        }

        if config.adaptive.stall_window_ms >= config.adaptive.hang_window_ms {
            return Err(ConfigError::InvalidAdaptiveWindows(
                config.adaptive.stall_window_ms,
                config.adaptive.hang_window_ms,
            ));
        }

        if config.gateway.rate_limit_rps <= 0.0 {
            return Err(ConfigError::InvalidRateLimit(config.gateway.rate_limit_rps));
        }

        if config.stream.backpressure_threshold >= config.stream.buffer_capacity {
            return Err(ConfigError::InvalidStreamBuffer(
                config.stream.backpressure_threshold,
                config.stream.buffer_capacity,
            ));
        }

        if config.analytics.path.is_empty() {
            return Err(ConfigError::EmptyAnalyticsPath);
        }

        Ok(())
    }
}
