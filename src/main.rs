use std::{process, sync::Arc};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::CronStream;
use feedtally::{
    application::{
        error::AppError,
        jobs::{
            JobWorkerContext, ReconcileJob, process_reconcile_job, process_tag_sync_job,
            process_trending_job,
        },
        repos::{TagsRepo, TrendingSource, ViewsRepo},
    },
    cache::{
        CacheConfig, Clock, CounterAggregator, KvStore, PopularityTracker, SystemClock,
        TrendingCache, WarmOutcome,
    },
    config::{self, Command},
    infra::{db::PostgresRepositories, error::InfraError, redis::RedisKv, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let causes = error.chain();
    if dispatcher::has_been_set() {
        error!(error = %error, ?causes, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, ?causes, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args.command.unwrap_or_default();

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        Command::Worker(_) => run_worker(settings).await,
        Command::Reconcile(_) => run_reconcile(settings).await,
        Command::SyncTags(_) => run_sync_tags(settings).await,
        Command::WarmTrending(_) => run_warm_trending(settings).await,
    }
}

/// Connections and shared configuration every command needs.
struct Runtime {
    repositories: Arc<PostgresRepositories>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    cache: CacheConfig,
}

impl Runtime {
    fn counters(&self) -> Arc<CounterAggregator> {
        Arc::new(CounterAggregator::new(self.kv.clone(), &self.cache))
    }

    fn reconcile_job(&self, settings: &config::Settings) -> ReconcileJob {
        let views: Arc<dyn ViewsRepo> = self.repositories.clone();
        ReconcileJob::new(
            self.counters(),
            views,
            settings.jobs.reconcile_batch_size.get() as usize,
        )
    }

    fn trending(&self) -> TrendingCache {
        let source: Arc<dyn TrendingSource> = self.repositories.clone();
        TrendingCache::new(self.kv.clone(), source, self.clock.clone(), &self.cache)
    }

    fn popularity(&self) -> PopularityTracker {
        let tags: Arc<dyn TagsRepo> = self.repositories.clone();
        PopularityTracker::new(self.kv.clone(), tags)
    }
}

async fn init_runtime(settings: &config::Settings) -> Result<Runtime, AppError> {
    let repositories = PostgresRepositories::connect(&settings.database).await?;
    repositories.health_check().await?;

    let redis = RedisKv::connect(&settings.redis.url, settings.redis.pool_size.get() as usize)?;
    redis.health_check().await?;

    Ok(Runtime {
        repositories: Arc::new(repositories),
        kv: Arc::new(redis),
        clock: Arc::new(SystemClock),
        cache: CacheConfig::from(&settings.cache),
    })
}

async fn run_reconcile(settings: config::Settings) -> Result<(), AppError> {
    let runtime = init_runtime(&settings).await?;
    let report = runtime.reconcile_job(&settings).run().await?;
    info!(
        run_id = %report.run_id,
        flushed = report.flushed,
        skipped = report.skipped,
        mismatched = report.mismatched,
        "reconcile command finished"
    );
    Ok(())
}

async fn run_sync_tags(settings: config::Settings) -> Result<(), AppError> {
    let runtime = init_runtime(&settings).await?;
    let active = runtime.popularity().sync_from_durable().await?;
    info!(active, "tag cache rebuilt");
    Ok(())
}

async fn run_warm_trending(settings: config::Settings) -> Result<(), AppError> {
    let runtime = init_runtime(&settings).await?;
    match runtime.trending().warm_cache().await {
        WarmOutcome::Failed => Err(AppError::unexpected("trending refresh failed")),
        outcome => {
            info!(?outcome, "trending warm finished");
            Ok(())
        }
    }
}

async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    let runtime = init_runtime(&settings).await?;
    let context = JobWorkerContext {
        reconcile: Arc::new(runtime.reconcile_job(&settings)),
        trending: runtime.trending(),
        popularity: Arc::new(runtime.popularity()),
    };

    let reconcile_worker = WorkerBuilder::new("reconcile-views-worker")
        .concurrency(1)
        .data(context.clone())
        .backend(CronStream::new(settings.jobs.reconcile_schedule.clone()))
        .build_fn(process_reconcile_job);
    let trending_worker = WorkerBuilder::new("warm-trending-worker")
        .concurrency(1)
        .data(context.clone())
        .backend(CronStream::new(settings.jobs.trending_schedule.clone()))
        .build_fn(process_trending_job);
    let tag_sync_worker = WorkerBuilder::new("sync-tags-worker")
        .concurrency(1)
        .data(context)
        .backend(CronStream::new(settings.jobs.tag_sync_schedule.clone()))
        .build_fn(process_tag_sync_job);

    info!("starting scheduled workers");
    Monitor::new()
        .register(reconcile_worker)
        .register(trending_worker)
        .register(tag_sync_worker)
        .run_with_signal(tokio::signal::ctrl_c())
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!("workers stopped");
    Ok(())
}
