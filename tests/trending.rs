mod support;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use feedtally::{
    cache::{CacheKey, Clock, Freshness, KvExt, TrendingCache, WarmOutcome},
    domain::entities::TrendingTopic,
};
use support::{Harness, tag};

fn trending(harness: &Harness) -> TrendingCache {
    TrendingCache::new(
        harness.kv_store(),
        harness.repos.clone(),
        harness.clock(),
        &harness.config,
    )
}

fn topic(hashtag: &str, count: u64) -> TrendingTopic {
    TrendingTopic {
        hashtag: hashtag.to_string(),
        count,
    }
}

fn seed_recent_posts(harness: &Harness) {
    let recent = harness.clock.now() - Duration::from_secs(60 * 60);
    let ancient = harness.clock.now() - Duration::from_secs(30 * 24 * 60 * 60);
    harness.repos.add_post("p1", recent);
    harness.repos.add_post("p2", recent);
    harness.repos.add_post("p3", ancient);
    harness.repos.tag_post("p1", &tag("rust"));
    harness.repos.tag_post("p2", &tag("rust"));
    harness.repos.tag_post("p2", &tag("tokio"));
    harness.repos.tag_post("p3", &tag("perl"));
}

#[tokio::test]
async fn refresh_is_due_after_half_the_ttl() {
    let harness = Harness::new();
    let cache = trending(&harness);
    assert!(cache.should_refresh().await);

    cache.set(&[topic("rust", 3)]).await.expect("set");
    assert!(!cache.should_refresh().await);

    harness.advance(harness.config.trending_refresh_after() + Duration::from_secs(1));
    assert!(cache.should_refresh().await);
}

#[tokio::test]
async fn freshness_moves_from_fresh_to_expired() {
    let harness = Harness::new();
    let cache = trending(&harness);
    let ttl = harness.config.trending_ttl;
    assert_eq!(cache.freshness().await, Freshness::Expired);

    cache.set(&[topic("rust", 3)]).await.expect("set");
    assert_eq!(cache.freshness().await, Freshness::Fresh);

    harness.advance(ttl / 2);
    assert_eq!(cache.freshness().await, Freshness::Stale);

    harness.advance(ttl / 2);
    assert_eq!(cache.freshness().await, Freshness::Expired);
}

#[tokio::test]
async fn backup_serves_after_the_primary_expires() {
    let harness = Harness::new();
    let cache = trending(&harness);
    cache.set(&[topic("rust", 3)]).await.expect("set");

    harness.advance(harness.config.trending_ttl + Duration::from_secs(1));
    assert!(
        !harness
            .kv
            .contains_key(CacheKey::trending_topics().as_str())
    );
    assert_eq!(cache.get().await, vec![topic("rust", 3)]);

    harness.advance(harness.config.trending_backup_ttl);
    assert!(cache.get().await.is_empty());
}

#[tokio::test]
async fn warm_cache_computes_from_recent_posts() {
    let harness = Harness::new();
    seed_recent_posts(&harness);
    let cache = trending(&harness);

    assert_eq!(cache.warm_cache().await, WarmOutcome::Refreshed(2));
    assert_eq!(cache.get().await, vec![topic("rust", 2), topic("tokio", 1)]);

    // Still fresh: the second call leaves the list alone.
    assert_eq!(cache.warm_cache().await, WarmOutcome::Skipped);
}

#[tokio::test]
async fn source_failure_keeps_the_previous_list() {
    let harness = Harness::new();
    let cache = trending(&harness);
    cache.set(&[topic("rust", 3)]).await.expect("set");
    harness.advance(harness.config.trending_ttl / 2 + Duration::from_secs(1));

    harness.repos.set_unavailable(true);

    assert_eq!(cache.warm_cache().await, WarmOutcome::Failed);
    assert_eq!(cache.get().await, vec![topic("rust", 3)]);
}

#[tokio::test]
async fn store_failure_reports_failed() {
    let harness = Harness::new();
    seed_recent_posts(&harness);
    let cache = trending(&harness);
    harness.kv.set_unavailable(true);

    assert_eq!(cache.warm_cache().await, WarmOutcome::Failed);
    assert!(cache.get().await.is_empty());
    assert_eq!(cache.freshness().await, Freshness::Expired);
}

#[tokio::test]
async fn get_or_refresh_serves_then_refreshes_in_background() {
    let harness = Harness::new();
    seed_recent_posts(&harness);
    let cache = trending(&harness);

    let (topics, handle) = cache.get_or_refresh().await;
    assert!(topics.is_empty());
    let outcome = handle.expect("refresh spawned").await.expect("join");
    assert_eq!(outcome, WarmOutcome::Refreshed(2));

    let (topics, handle) = cache.get_or_refresh().await;
    assert_eq!(topics.len(), 2);
    assert!(handle.is_none());
}

#[tokio::test]
async fn concurrent_readers_spawn_a_single_refresh() {
    let harness = Harness::new();
    seed_recent_posts(&harness);
    let cache = trending(&harness);

    let (_, first) = cache.get_or_refresh().await;
    let (_, second) = cache.get_or_refresh().await;
    assert!(harness.kv.contains_key(CacheKey::trending_refreshing().as_str()));

    let first = first.expect("first reader refreshes");
    assert!(second.is_none());
    assert_eq!(first.await.expect("join"), WarmOutcome::Refreshed(2));
    assert!(!harness.kv.contains_key(CacheKey::trending_refreshing().as_str()));
}

#[tokio::test]
async fn cron_refresh_skips_while_a_reader_refreshes() {
    let harness = Harness::new();
    seed_recent_posts(&harness);
    let cache = trending(&harness);

    let (_, handle) = cache.get_or_refresh().await;
    assert_eq!(cache.warm_cache().await, WarmOutcome::Skipped);
    assert_eq!(
        handle.expect("refresh spawned").await.expect("join"),
        WarmOutcome::Refreshed(2)
    );
}

#[tokio::test]
async fn abandoned_refresh_claim_expires() {
    let harness = Harness::new();
    seed_recent_posts(&harness);
    let cache = trending(&harness);
    harness
        .kv
        .set_with_ttl(
            CacheKey::trending_refreshing().as_str(),
            Bytes::from_static(b"1"),
            Duration::from_secs(30),
        )
        .await
        .expect("seed claim");

    assert_eq!(cache.warm_cache().await, WarmOutcome::Skipped);
    harness.advance(Duration::from_secs(31));
    assert_eq!(cache.warm_cache().await, WarmOutcome::Refreshed(2));
}

#[tokio::test]
async fn limit_caps_the_list() {
    let mut harness = Harness::new();
    harness.config.trending_limit = 1;
    seed_recent_posts(&harness);
    let source = Arc::clone(&harness.repos);
    let cache = TrendingCache::new(
        harness.kv_store(),
        source,
        harness.clock(),
        &harness.config,
    );

    assert_eq!(cache.warm_cache().await, WarmOutcome::Refreshed(1));
    assert_eq!(cache.get().await, vec![topic("rust", 2)]);
}
