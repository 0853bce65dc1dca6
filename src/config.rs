//! Typed settings with layered precedence (file → explicit file → environment).

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::hydration::{DEFAULT_STALE_WHILE_REVALIDATE, DEFAULT_TTL};

const LOCAL_CONFIG_BASENAME: &str = "cached-status";
const ENV_PREFIX: &str = "CACHED_STATUS";
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_NEWSLETTER_BASE_URL: &str = "https://api.convertkit.com";
const DEFAULT_NEWSLETTER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub newsletter: NewsletterSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub stale_while_revalidate: Duration,
    /// When set, entries are kept on disk here and survive restarts. Otherwise in memory.
    pub directory: Option<PathBuf>,
    pub max_entries: NonZeroUsize,
    pub format: StoreFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    Json,
    Bincode,
}

#[derive(Debug, Clone)]
pub struct NewsletterSettings {
    pub base_url: String,
    pub api_secret: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings from `cached-status.{toml,json,...}` in the working directory, then the
/// explicit `config_file` if given, then `CACHED_STATUS__SECTION__KEY` environment variables.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    from_builder(builder)
}

fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Settings, LoadError> {
    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    newsletter: RawNewsletterSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    ttl_secs: Option<u64>,
    stale_while_revalidate_secs: Option<u64>,
    directory: Option<PathBuf>,
    max_entries: Option<usize>,
    format: Option<StoreFormat>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNewsletterSettings {
    base_url: Option<String>,
    api_secret: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            cache: CacheSettings::from_raw(raw.cache)?,
            newsletter: NewsletterSettings::from_raw(raw.newsletter)?,
            logging: LoggingSettings::from_raw(raw.logging)?,
        })
    }
}

impl CacheSettings {
    fn from_raw(raw: RawCacheSettings) -> Result<Self, LoadError> {
        let max_entries = NonZeroUsize::new(raw.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES))
            .ok_or_else(|| LoadError::invalid("cache.max_entries", "must be greater than zero"))?;

        Ok(Self {
            ttl: raw.ttl_secs.map(Duration::from_secs).unwrap_or(DEFAULT_TTL),
            stale_while_revalidate: raw
                .stale_while_revalidate_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STALE_WHILE_REVALIDATE),
            directory: raw.directory,
            max_entries,
            format: raw.format.unwrap_or(StoreFormat::Json),
        })
    }
}

impl NewsletterSettings {
    fn from_raw(raw: RawNewsletterSettings) -> Result<Self, LoadError> {
        let base_url = raw
            .base_url
            .unwrap_or_else(|| DEFAULT_NEWSLETTER_BASE_URL.to_string());
        if base_url.trim().is_empty() {
            return Err(LoadError::invalid("newsletter.base_url", "must not be empty"));
        }

        let timeout_secs = raw.timeout_secs.unwrap_or(DEFAULT_NEWSLETTER_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(LoadError::invalid(
                "newsletter.timeout_secs",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            base_url,
            api_secret: raw.api_secret.unwrap_or_default(),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

impl LoggingSettings {
    fn from_raw(raw: RawLoggingSettings) -> Result<Self, LoadError> {
        let level = match raw.level {
            Some(level) => LevelFilter::from_str(&level)
                .map_err(|err| LoadError::invalid("logging.level", err.to_string()))?,
            None => DEFAULT_LOG_LEVEL,
        };

        Ok(Self {
            level,
            format: raw.format.unwrap_or(LogFormat::Compact),
        })
    }
}
