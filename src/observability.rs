//! Logging setup for featurizer runs.
//!
//! Configuration comes from `FEATURIZER_LOG_LEVEL`, `FEATURIZER_LOG_FORMAT` (`json` or
//! `pretty`) and `FEATURIZER_LOG_TARGET`. Unset or unparsable values keep the defaults.

use std::env;
use std::str::FromStr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "FEATURIZER_LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "FEATURIZER_LOG_FORMAT";
pub const LOG_TARGET_ENV: &str = "FEATURIZER_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_value(LOG_LEVEL_ENV)
            .filter(|level| !level.is_empty())
            .unwrap_or(defaults.level),
        format: env_value(LOG_FORMAT_ENV)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.format),
        include_target: env_value(LOG_TARGET_ENV)
            .and_then(|raw| parse_flag(&raw))
            .unwrap_or(defaults.include_target),
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }
    log_logging_ready(config);
    Ok(())
}

pub fn log_logging_ready(config: &LoggingConfig) {
    info!(
        component = "featurizer",
        event = "logging.ready",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_run_start(feature_count: usize, labeled: bool, max_concurrent: usize) {
    info!(
        component = "featurizer",
        event = "run.start",
        feature_count,
        labeled,
        max_concurrent
    );
}

pub fn log_run_finish(result_blocks: usize, elapsed_ms: u64) {
    info!(
        component = "featurizer",
        event = "run.finish",
        result_blocks,
        elapsed_ms
    );
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().map(|raw| raw.trim().to_string())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
