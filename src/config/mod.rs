//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::str::FromStr;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, KeyArgs, PolicyArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "classifieds";
const ENV_PREFIX: &str = "CLASSIFIEDS";
const DEFAULT_ENVIRONMENT: &str = "production";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub logging: LoggingSettings,
    /// Cache configuration with the active environment's overrides applied.
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub environment: String,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    app: RawAppSettings,
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(environment) = overrides.environment.as_ref() {
            self.app.environment = Some(environment.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            app,
            logging,
            cache,
        } = raw;

        let app = build_app_settings(app)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache, &app.environment)?;

        Ok(Self {
            app,
            logging,
            cache,
        })
    }
}

fn build_app_settings(app: RawAppSettings) -> Result<AppSettings, LoadError> {
    let environment = match app.environment {
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(LoadError::invalid("app.environment", "must not be empty"));
            }
            trimmed.to_string()
        }
        None => DEFAULT_ENVIRONMENT.to_string(),
    };

    Ok(AppSettings { environment })
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

fn build_cache_settings(cache: CacheConfig, environment: &str) -> Result<CacheConfig, LoadError> {
    let cache = cache.for_environment(environment);

    if cache.version_prefix.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.version_prefix",
            "must not be empty",
        ));
    }
    if cache.version_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "cache.version_ttl_secs",
            "must be greater than zero",
        ));
    }
    if cache.version_ttl() < cache.default_ttl() {
        return Err(LoadError::invalid(
            "cache.version_ttl_secs",
            format!(
                "must not be shorter than the default entry TTL ({}s)",
                cache.default_ttl().as_secs()
            ),
        ));
    }
    if let Some((kind, ttl)) = cache
        .models
        .iter()
        .filter_map(|(kind, model)| model.ttl_secs.map(|ttl| (kind, ttl)))
        .find(|(_, ttl)| *ttl > cache.version_ttl_secs)
    {
        return Err(LoadError::invalid(
            "cache.models.ttl_secs",
            format!(
                "`{kind}` ttl of {ttl}s exceeds the version TTL ({}s)",
                cache.version_ttl_secs
            ),
        ));
    }
    if cache.store_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.store_capacity",
            "must be greater than zero",
        ));
    }

    Ok(cache)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAppSettings {
    environment: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
