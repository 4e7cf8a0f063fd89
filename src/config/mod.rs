//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    BooksArgs, CliArgs, Command, FavoritesCommand, FeedCommand, Overrides, PrefsCommand,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "libris";
const DEFAULT_BASE_URL: &str = "http://localhost:8083/api/";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CACHE_CAPACITY: usize = 512;
const DEFAULT_RETRY_COUNT: u32 = 1;
const DEFAULT_RETRY_DELAY_MS: u64 = 250;
const DEFAULT_PREFERENCES_PATH: &str = "libris-preferences.toml";
const MAX_RETRY_COUNT: u32 = 5;

#[derive(Debug, Clone)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub preferences: PreferenceSettings,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub base_url: Url,
    pub timeout: Duration,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: NonZeroUsize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Staleness overrides keyed by `namespace` or `namespace.operation`.
    pub stale_overrides: BTreeMap<String, Duration>,
}

#[derive(Debug, Clone)]
pub struct PreferenceSettings {
    pub path: PathBuf,
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("LIBRIS").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    gateway: RawGatewaySettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    preferences: RawPreferenceSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(url) = overrides.base_url.as_ref() {
            self.gateway.base_url = Some(url.clone());
        }
        if let Some(token) = overrides.token.as_ref() {
            self.gateway.token = Some(token.clone());
        }
        if let Some(seconds) = overrides.timeout_seconds {
            self.gateway.timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(path) = overrides.preferences_path.as_ref() {
            self.preferences.path = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            gateway,
            logging,
            cache,
            preferences,
        } = raw;

        Ok(Self {
            gateway: build_gateway_settings(gateway)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            preferences: build_preference_settings(preferences)?,
        })
    }
}

fn build_gateway_settings(gateway: RawGatewaySettings) -> Result<GatewaySettings, LoadError> {
    let raw_url = gateway
        .base_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let base_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("gateway.base_url", format!("failed to parse: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "gateway.base_url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = gateway.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "gateway.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let token = gateway.token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(GatewaySettings {
        base_url,
        timeout: Duration::from_secs(timeout_secs),
        token,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity = NonZeroUsize::new(cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY))
        .ok_or_else(|| LoadError::invalid("cache.capacity", "must be greater than zero"))?;

    let retry_count = cache.retry_count.unwrap_or(DEFAULT_RETRY_COUNT);
    if retry_count > MAX_RETRY_COUNT {
        return Err(LoadError::invalid(
            "cache.retry_count",
            format!("must be at most {MAX_RETRY_COUNT}"),
        ));
    }

    let retry_delay = Duration::from_millis(cache.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS));

    let mut stale_overrides = BTreeMap::new();
    for (name, seconds) in cache.stale_seconds {
        if seconds == 0 {
            return Err(LoadError::invalid(
                "cache.stale_seconds",
                format!("`{name}` must be greater than zero"),
            ));
        }
        // Environment keys cannot hold dots: `books_detail` means `books.detail`.
        let name = name.to_lowercase().replacen('_', ".", 1);
        stale_overrides.insert(name, Duration::from_secs(seconds));
    }

    Ok(CacheSettings {
        capacity,
        retry_count,
        retry_delay,
        stale_overrides,
    })
}

fn build_preference_settings(
    preferences: RawPreferenceSettings,
) -> Result<PreferenceSettings, LoadError> {
    let path = preferences
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFERENCES_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "preferences.path",
            "path must not be empty",
        ));
    }
    Ok(PreferenceSettings { path })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGatewaySettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    capacity: Option<usize>,
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
    stale_seconds: HashMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPreferenceSettings {
    path: Option<PathBuf>,
}

#[cfg(test)]
mod tests;
