//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::monitor::AlertThreshold;
use crate::optimizer::{BUDGET_UTILIZATION, FamilyPolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "fathom";
const DEFAULT_CACHE_LOCAL_CAPACITY: u64 = 1000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_COMPRESSION_THRESHOLD_BYTES: u64 = 1024;
const DEFAULT_CACHE_NAMESPACE: &str = "default";
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;
const DEFAULT_OPTIMIZER_NAMESPACE: &str = "query";
const DEFAULT_HISTORY_LIMIT: u64 = 100;
const DEFAULT_WINDOW_SIZE: u64 = 1000;
const DEFAULT_EVALUATION_INTERVAL_SECS: u64 = 30;
const DEFAULT_COUNTER_RESET_INTERVAL_SECS: u64 = 60;
const DEFAULT_ALERT_HISTORY_LIMIT: u64 = 500;

/// Command-line arguments for the Fathom binary.
#[derive(Debug, Parser)]
#[command(
    name = "fathom",
    version,
    about = "Caching and query-resolution layer for analytics workloads"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FATHOM_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Resolve and print the effective configuration.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long = "log-json", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub log_json: Option<bool>,

    /// Override the number of entries kept in the process-local tier.
    #[arg(long = "cache-local-capacity", value_name = "ENTRIES")]
    pub cache_local_capacity: Option<u64>,

    /// Run with the process-local tier only.
    #[arg(long = "cache-disable-remote", action = clap::ArgAction::SetTrue)]
    pub cache_disable_remote: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub optimizer: OptimizerSettings,
    pub monitor: MonitorSettings,
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
    pub local_capacity: NonZeroUsize,
    pub default_ttl: Duration,
    /// Payloads at or above this size are compressed when requested.
    pub compression_threshold_bytes: usize,
    pub default_namespace: String,
    pub enable_remote: bool,
    pub purge_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    pub namespace: String,
    pub defaults: FamilyPolicy,
    pub families: HashMap<String, FamilyPolicy>,
    pub history_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub window_size: NonZeroUsize,
    pub evaluation_interval: Duration,
    pub counter_reset_interval: Duration,
    pub alert_history_limit: NonZeroUsize,
    pub thresholds: Vec<AlertThreshold>,
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

    builder = builder.add_source(Environment::with_prefix("FATHOM").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::CheckConfig(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&Overrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    optimizer: RawOptimizerSettings,
    monitor: RawMonitorSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(capacity) = overrides.cache_local_capacity {
            self.cache.local_capacity = Some(capacity);
        }
        if overrides.cache_disable_remote {
            self.cache.enable_remote = Some(false);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            optimizer,
            monitor,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            optimizer: build_optimizer_settings(optimizer)?,
            monitor: build_monitor_settings(monitor)?,
        })
    }
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
    let local_capacity = non_zero_usize(
        cache.local_capacity.unwrap_or(DEFAULT_CACHE_LOCAL_CAPACITY),
        "cache.local_capacity",
    )?;
    let default_ttl = seconds(
        cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        "cache.default_ttl_seconds",
    )?;
    let purge_interval = seconds(
        cache
            .purge_interval_seconds
            .unwrap_or(DEFAULT_PURGE_INTERVAL_SECS),
        "cache.purge_interval_seconds",
    )?;

    let compression_threshold_bytes = usize::try_from(
        cache
            .compression_threshold_bytes
            .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD_BYTES),
    )
    .map_err(|_| {
        LoadError::invalid(
            "cache.compression_threshold_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    let default_namespace = non_blank(
        cache.default_namespace,
        DEFAULT_CACHE_NAMESPACE,
        "cache.default_namespace",
    )?;

    Ok(CacheSettings {
        local_capacity,
        default_ttl,
        compression_threshold_bytes,
        default_namespace,
        enable_remote: cache.enable_remote.unwrap_or(true),
        purge_interval,
    })
}

fn build_optimizer_settings(
    optimizer: RawOptimizerSettings,
) -> Result<OptimizerSettings, LoadError> {
    let namespace = non_blank(
        optimizer.namespace,
        DEFAULT_OPTIMIZER_NAMESPACE,
        "optimizer.namespace",
    )?;
    let history_limit = non_zero_usize(
        optimizer.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        "optimizer.history_limit",
    )?;

    let defaults = optimizer
        .defaults
        .apply_to(FamilyPolicy::default(), "optimizer.defaults")?;

    let mut families = HashMap::new();
    families.insert(
        BUDGET_UTILIZATION.to_string(),
        FamilyPolicy {
            incremental: true,
            ..defaults.clone()
        },
    );
    for (family, raw) in optimizer.families {
        if family.trim().is_empty() {
            return Err(LoadError::invalid(
                "optimizer.families",
                "family name must not be empty",
            ));
        }
        let base = families
            .remove(&family)
            .unwrap_or_else(|| defaults.clone());
        let policy = raw.apply_to(base, "optimizer.families")?;
        families.insert(family, policy);
    }

    Ok(OptimizerSettings {
        namespace,
        defaults,
        families,
        history_limit,
    })
}

fn build_monitor_settings(monitor: RawMonitorSettings) -> Result<MonitorSettings, LoadError> {
    let window_size = non_zero_usize(
        monitor.window_size.unwrap_or(DEFAULT_WINDOW_SIZE),
        "monitor.window_size",
    )?;
    let alert_history_limit = non_zero_usize(
        monitor
            .alert_history_limit
            .unwrap_or(DEFAULT_ALERT_HISTORY_LIMIT),
        "monitor.alert_history_limit",
    )?;
    let evaluation_interval = seconds(
        monitor
            .evaluation_interval_seconds
            .unwrap_or(DEFAULT_EVALUATION_INTERVAL_SECS),
        "monitor.evaluation_interval_seconds",
    )?;
    let counter_reset_interval = seconds(
        monitor
            .counter_reset_interval_seconds
            .unwrap_or(DEFAULT_COUNTER_RESET_INTERVAL_SECS),
        "monitor.counter_reset_interval_seconds",
    )?;

    let thresholds = match monitor.thresholds {
        Some(thresholds) if !thresholds.is_empty() => thresholds,
        _ => AlertThreshold::defaults(),
    };
    for threshold in &thresholds {
        if threshold.metric.trim().is_empty() {
            return Err(LoadError::invalid(
                "monitor.thresholds",
                "metric path must not be empty",
            ));
        }
        if !threshold.value.is_finite() {
            return Err(LoadError::invalid(
                "monitor.thresholds",
                format!("value for `{}` must be finite", threshold.metric),
            ));
        }
    }

    Ok(MonitorSettings {
        window_size,
        evaluation_interval,
        counter_reset_interval,
        alert_history_limit,
        thresholds,
    })
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
    local_capacity: Option<u64>,
    default_ttl_seconds: Option<u64>,
    compression_threshold_bytes: Option<u64>,
    default_namespace: Option<String>,
    enable_remote: Option<bool>,
    purge_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOptimizerSettings {
    namespace: Option<String>,
    history_limit: Option<u64>,
    defaults: RawFamilyPolicy,
    families: HashMap<String, RawFamilyPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFamilyPolicy {
    incremental: Option<bool>,
    materialized: Option<bool>,
    cache_ttl_seconds: Option<u64>,
    materialized_ttl_seconds: Option<u64>,
    delta_freshness_seconds: Option<u64>,
    compute_timeout_seconds: Option<u64>,
}

impl RawFamilyPolicy {
    fn apply_to(self, mut policy: FamilyPolicy, key: &'static str) -> Result<FamilyPolicy, LoadError> {
        if let Some(incremental) = self.incremental {
            policy.incremental = incremental;
        }
        if let Some(materialized) = self.materialized {
            policy.materialized = materialized;
        }
        if let Some(value) = self.cache_ttl_seconds {
            policy.cache_ttl = seconds(value, key)?;
        }
        if let Some(value) = self.materialized_ttl_seconds {
            policy.materialized_ttl = seconds(value, key)?;
        }
        if let Some(value) = self.delta_freshness_seconds {
            policy.delta_freshness = seconds(value, key)?;
        }
        if let Some(value) = self.compute_timeout_seconds {
            policy.compute_timeout = seconds(value, key)?;
        }
        Ok(policy)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMonitorSettings {
    window_size: Option<u64>,
    evaluation_interval_seconds: Option<u64>,
    counter_reset_interval_seconds: Option<u64>,
    alert_history_limit: Option<u64>,
    thresholds: Option<Vec<AlertThreshold>>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_blank(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    match value {
        None => Ok(default.to_string()),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(LoadError::invalid(key, "must not be empty"));
            }
            Ok(trimmed.to_string())
        }
    }
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
