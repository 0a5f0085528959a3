use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the feedtally binary.
#[derive(Debug, Parser)]
#[command(
    name = "feedtally",
    version,
    about = "Engagement counters in Redis, reconciled into Postgres"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FEEDTALLY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the scheduled reconciliation, trending and tag sync jobs until interrupted.
    Worker(WorkerArgs),
    /// Flush dirty view counters into the durable store once.
    Reconcile(ReconcileArgs),
    /// Rebuild the tag cache from the durable store.
    #[command(name = "sync-tags")]
    SyncTags(RuntimeArgs),
    /// Recompute trending topics if the cached list is due.
    #[command(name = "warm-trending")]
    WarmTrending(RuntimeArgs),
}

impl Default for Command {
    fn default() -> Self {
        Command::Worker(WorkerArgs::default())
    }
}

/// Overrides shared by every command.
#[derive(Debug, Args, Default, Clone)]
pub struct RuntimeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the Redis pool size.
    #[arg(long = "redis-pool-size", value_name = "COUNT")]
    pub redis_pool_size: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RuntimeArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,

    /// Override the reconciliation cron expression (six fields, seconds first).
    #[arg(long = "jobs-reconcile-cron", value_name = "CRON")]
    pub reconcile_cron: Option<String>,

    /// Override the trending refresh cron expression (six fields, seconds first).
    #[arg(long = "jobs-trending-cron", value_name = "CRON")]
    pub trending_cron: Option<String>,

    /// Override the tag sync cron expression (six fields, seconds first).
    #[arg(long = "jobs-tag-sync-cron", value_name = "CRON")]
    pub tag_sync_cron: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,

    /// Override the number of counters written per durable transaction.
    #[arg(long = "batch-size", value_name = "COUNT")]
    pub batch_size: Option<u32>,
}
