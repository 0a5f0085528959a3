//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use apalis_cron::Schedule;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_FOLLOWER_BACKUP_TTL_SECS, DEFAULT_FOLLOWER_TTL_SECS, DEFAULT_HISTORY_LIMIT,
    DEFAULT_HISTORY_TTL_SECS, DEFAULT_SCAN_PAGE_SIZE, DEFAULT_SHARE_STAT_TTL_SECS,
    DEFAULT_SUGGESTIONS_LIMIT, DEFAULT_SUGGESTIONS_TTL_SECS, DEFAULT_TRENDING_BACKUP_TTL_SECS,
    DEFAULT_TRENDING_LIMIT, DEFAULT_TRENDING_TTL_SECS, DEFAULT_TRENDING_WINDOW_SECS,
    DEFAULT_VIEW_COUNTER_TTL_SECS, MIN_BACKUP_TTL_FACTOR, backup_ttl_is_sufficient,
};

mod cli;

pub use cli::{CliArgs, Command, ReconcileArgs, RuntimeArgs, RuntimeOverrides, WorkerArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "feedtally";
const ENV_PREFIX: &str = "FEEDTALLY";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_REDIS_POOL_SIZE: u32 = 16;
const DEFAULT_RECONCILE_CRON: &str = "0 */5 * * * *";
const DEFAULT_TRENDING_CRON: &str = "0 */10 * * * *";
const DEFAULT_TAG_SYNC_CRON: &str = "0 0 * * * *";
pub(crate) const DEFAULT_RECONCILE_BATCH_SIZE: u32 = 100;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub jobs: JobsSettings,
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
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub pool_size: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub follower_ttl: Duration,
    pub follower_backup_ttl: Duration,
    pub view_counter_ttl: Duration,
    pub share_stat_ttl: Duration,
    pub trending_ttl: Duration,
    pub trending_backup_ttl: Duration,
    pub trending_window: Duration,
    pub trending_limit: usize,
    pub suggestions_ttl: Duration,
    pub suggestions_limit: usize,
    pub history_ttl: Duration,
    pub history_limit: usize,
    pub scan_page_size: usize,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub reconcile_schedule: Schedule,
    pub trending_schedule: Schedule,
    pub tag_sync_schedule: Schedule,
    pub reconcile_batch_size: NonZeroU32,
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
    raw.apply_command(cli.command.as_ref());

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    redis: RawRedisSettings,
    cache: RawCacheSettings,
    jobs: RawJobsSettings,
}

impl RawSettings {
    fn apply_command(&mut self, command: Option<&Command>) {
        match command {
            Some(Command::Worker(args)) => self.apply_worker_overrides(args),
            Some(Command::Reconcile(args)) => {
                self.apply_runtime_overrides(&args.overrides);
                if let Some(size) = args.batch_size {
                    self.jobs.reconcile_batch_size = Some(size);
                }
            }
            Some(Command::SyncTags(args)) | Some(Command::WarmTrending(args)) => {
                self.apply_runtime_overrides(&args.overrides)
            }
            None => self.apply_worker_overrides(&WorkerArgs::default()),
        }
    }

    fn apply_worker_overrides(&mut self, args: &WorkerArgs) {
        self.apply_runtime_overrides(&args.overrides);
        if let Some(cron) = args.reconcile_cron.as_ref() {
            self.jobs.reconcile_cron = Some(cron.clone());
        }
        if let Some(cron) = args.trending_cron.as_ref() {
            self.jobs.trending_cron = Some(cron.clone());
        }
        if let Some(cron) = args.tag_sync_cron.as_ref() {
            self.jobs.tag_sync_cron = Some(cron.clone());
        }
    }

    fn apply_runtime_overrides(&mut self, overrides: &RuntimeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(size) = overrides.redis_pool_size {
            self.redis.pool_size = Some(size);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            redis,
            cache,
            jobs,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            redis: build_redis_settings(redis)?,
            cache: build_cache_settings(cache)?,
            jobs: build_jobs_settings(jobs)?,
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

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = non_blank(redis.url).unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
        return Err(LoadError::invalid(
            "redis.url",
            "must start with redis:// or rediss://",
        ));
    }
    let pool_size = non_zero_u32(
        redis.pool_size.unwrap_or(DEFAULT_REDIS_POOL_SIZE).into(),
        "redis.pool_size",
    )?;

    Ok(RedisSettings { url, pool_size })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let follower_ttl = seconds(
        cache.follower_ttl_seconds,
        DEFAULT_FOLLOWER_TTL_SECS,
        "cache.follower_ttl_seconds",
    )?;
    let follower_backup_ttl = seconds(
        cache.follower_backup_ttl_seconds,
        DEFAULT_FOLLOWER_BACKUP_TTL_SECS,
        "cache.follower_backup_ttl_seconds",
    )?;
    ensure_backup_ratio(
        follower_ttl,
        follower_backup_ttl,
        "cache.follower_backup_ttl_seconds",
    )?;

    let trending_ttl = seconds(
        cache.trending_ttl_seconds,
        DEFAULT_TRENDING_TTL_SECS,
        "cache.trending_ttl_seconds",
    )?;
    let trending_backup_ttl = seconds(
        cache.trending_backup_ttl_seconds,
        DEFAULT_TRENDING_BACKUP_TTL_SECS,
        "cache.trending_backup_ttl_seconds",
    )?;
    ensure_backup_ratio(
        trending_ttl,
        trending_backup_ttl,
        "cache.trending_backup_ttl_seconds",
    )?;

    Ok(CacheSettings {
        follower_ttl,
        follower_backup_ttl,
        view_counter_ttl: seconds(
            cache.view_counter_ttl_seconds,
            DEFAULT_VIEW_COUNTER_TTL_SECS,
            "cache.view_counter_ttl_seconds",
        )?,
        share_stat_ttl: seconds(
            cache.share_stat_ttl_seconds,
            DEFAULT_SHARE_STAT_TTL_SECS,
            "cache.share_stat_ttl_seconds",
        )?,
        trending_ttl,
        trending_backup_ttl,
        trending_window: seconds(
            cache.trending_window_seconds,
            DEFAULT_TRENDING_WINDOW_SECS,
            "cache.trending_window_seconds",
        )?,
        trending_limit: positive(
            cache.trending_limit,
            DEFAULT_TRENDING_LIMIT,
            "cache.trending_limit",
        )?,
        suggestions_ttl: seconds(
            cache.suggestions_ttl_seconds,
            DEFAULT_SUGGESTIONS_TTL_SECS,
            "cache.suggestions_ttl_seconds",
        )?,
        suggestions_limit: positive(
            cache.suggestions_limit,
            DEFAULT_SUGGESTIONS_LIMIT,
            "cache.suggestions_limit",
        )?,
        history_ttl: seconds(
            cache.history_ttl_seconds,
            DEFAULT_HISTORY_TTL_SECS,
            "cache.history_ttl_seconds",
        )?,
        history_limit: positive(
            cache.history_limit,
            DEFAULT_HISTORY_LIMIT,
            "cache.history_limit",
        )?,
        scan_page_size: positive(
            cache.scan_page_size,
            DEFAULT_SCAN_PAGE_SIZE,
            "cache.scan_page_size",
        )?,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let reconcile_schedule = parse_schedule(
        jobs.reconcile_cron.as_deref().unwrap_or(DEFAULT_RECONCILE_CRON),
        "jobs.reconcile_cron",
    )?;
    let trending_schedule = parse_schedule(
        jobs.trending_cron.as_deref().unwrap_or(DEFAULT_TRENDING_CRON),
        "jobs.trending_cron",
    )?;
    let tag_sync_schedule = parse_schedule(
        jobs.tag_sync_cron.as_deref().unwrap_or(DEFAULT_TAG_SYNC_CRON),
        "jobs.tag_sync_cron",
    )?;
    let reconcile_batch_size = non_zero_u32(
        jobs.reconcile_batch_size
            .unwrap_or(DEFAULT_RECONCILE_BATCH_SIZE)
            .into(),
        "jobs.reconcile_batch_size",
    )?;

    Ok(JobsSettings {
        reconcile_schedule,
        trending_schedule,
        tag_sync_schedule,
        reconcile_batch_size,
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
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
    pool_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    follower_ttl_seconds: Option<u64>,
    follower_backup_ttl_seconds: Option<u64>,
    view_counter_ttl_seconds: Option<u64>,
    share_stat_ttl_seconds: Option<u64>,
    trending_ttl_seconds: Option<u64>,
    trending_backup_ttl_seconds: Option<u64>,
    trending_window_seconds: Option<u64>,
    trending_limit: Option<usize>,
    suggestions_ttl_seconds: Option<u64>,
    suggestions_limit: Option<usize>,
    history_ttl_seconds: Option<u64>,
    history_limit: Option<usize>,
    scan_page_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    reconcile_cron: Option<String>,
    trending_cron: Option<String>,
    tag_sync_cron: Option<String>,
    reconcile_batch_size: Option<u32>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn seconds(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn positive(value: Option<usize>, default: usize, key: &'static str) -> Result<usize, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        value => Ok(value),
    }
}

fn ensure_backup_ratio(
    primary: Duration,
    backup: Duration,
    key: &'static str,
) -> Result<(), LoadError> {
    if backup_ttl_is_sufficient(primary, backup) {
        Ok(())
    } else {
        Err(LoadError::invalid(
            key,
            format!(
                "backup ttl {}s must be at least {MIN_BACKUP_TTL_FACTOR}x the primary ttl {}s",
                backup.as_secs(),
                primary.as_secs()
            ),
        ))
    }
}

fn parse_schedule(expression: &str, key: &'static str) -> Result<Schedule, LoadError> {
    Schedule::from_str(expression.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid cron expression: {err}")))
}

#[cfg(test)]
mod tests;
