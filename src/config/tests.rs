use std::time::Duration;

use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert!(settings.database.url.is_none());
    assert_eq!(settings.redis.url, DEFAULT_REDIS_URL);
    assert_eq!(settings.cache.follower_ttl, Duration::from_secs(300));
    assert_eq!(settings.cache.follower_backup_ttl, Duration::from_secs(3600));
    assert_eq!(settings.cache.history_limit, 10);
    assert_eq!(
        settings.jobs.reconcile_batch_size.get(),
        DEFAULT_RECONCILE_BATCH_SIZE
    );
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.database.url = Some("postgres://from-file".to_string());

    let args = CliArgs::parse_from([
        "feedtally",
        "reconcile",
        "--log-level",
        "debug",
        "--database-url",
        "postgres://from-cli",
        "--batch-size",
        "25",
    ]);
    raw.apply_command(args.command.as_ref());
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(
        settings.database.url.as_deref(),
        Some("postgres://from-cli")
    );
    assert_eq!(settings.jobs.reconcile_batch_size.get(), 25);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let args = CliArgs::parse_from(["feedtally", "sync-tags", "--log-json", "true"]);
    raw.apply_command(args.command.as_ref());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_worker_command() {
    let args = CliArgs::parse_from(["feedtally"]);
    let command = args.command.unwrap_or_default();
    assert!(matches!(command, Command::Worker(_)));
}

#[test]
fn parse_warm_trending_with_redis_override() {
    let args = CliArgs::parse_from([
        "feedtally",
        "warm-trending",
        "--redis-url",
        "redis://cache:6380",
    ]);

    match args.command.expect("warm-trending command") {
        Command::WarmTrending(runtime) => {
            assert_eq!(
                runtime.overrides.redis_url.as_deref(),
                Some("redis://cache:6380")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn zero_ttl_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.view_counter_ttl_seconds = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero ttl");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.view_counter_ttl_seconds",
            ..
        }
    ));
}

#[test]
fn backup_shorter_than_four_primaries_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.follower_ttl_seconds = Some(600);
    raw.cache.follower_backup_ttl_seconds = Some(1800);

    let err = Settings::from_raw(raw).expect_err("ratio violated");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.follower_backup_ttl_seconds",
            ..
        }
    ));
}

#[test]
fn backup_exactly_four_primaries_is_accepted() {
    let mut raw = RawSettings::default();
    raw.cache.trending_ttl_seconds = Some(900);
    raw.cache.trending_backup_ttl_seconds = Some(3600);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.trending_backup_ttl, Duration::from_secs(3600));
}

#[test]
fn zero_batch_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.jobs.reconcile_batch_size = Some(0);

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn bad_cron_is_rejected() {
    let mut raw = RawSettings::default();
    raw.jobs.trending_cron = Some("every tuesday".to_string());

    let err = Settings::from_raw(raw).expect_err("bad cron");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "jobs.trending_cron",
            ..
        }
    ));
}

#[test]
fn worker_cron_override_is_applied() {
    let mut raw = RawSettings::default();
    let args = CliArgs::parse_from(["feedtally", "worker", "--jobs-reconcile-cron", "0 * * * * *"]);
    raw.apply_command(args.command.as_ref());

    assert_eq!(raw.jobs.reconcile_cron.as_deref(), Some("0 * * * * *"));
    assert!(Settings::from_raw(raw).is_ok());
}

#[test]
fn tag_sync_cron_override_is_validated() {
    let mut raw = RawSettings::default();
    let args = CliArgs::parse_from(["feedtally", "worker", "--jobs-tag-sync-cron", "hourly"]);
    raw.apply_command(args.command.as_ref());

    assert_eq!(raw.jobs.tag_sync_cron.as_deref(), Some("hourly"));
    let err = Settings::from_raw(raw).expect_err("bad cron");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "jobs.tag_sync_cron",
            ..
        }
    ));
}

#[test]
fn non_redis_url_is_rejected() {
    let mut raw = RawSettings::default();
    raw.redis.url = Some("http://localhost".to_string());

    assert!(Settings::from_raw(raw).is_err());
}
