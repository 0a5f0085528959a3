mod support;

use std::time::Duration;

use feedtally::{cache::CacheKey, domain::values::Platform};
use support::{Harness, ids};

#[tokio::test]
async fn five_views_read_back_as_five() {
    let harness = Harness::new();
    let counters = harness.counters();

    for expected in 1..=5 {
        assert_eq!(counters.increment_view("p1").await, expected);
    }

    assert_eq!(counters.get_views("p1").await, 5);
    assert!(counters.is_in_dirty_set("p1").await);
    assert_eq!(counters.get_views("never-viewed").await, 0);
}

#[tokio::test]
async fn view_counter_carries_its_ttl() {
    let harness = Harness::new();
    let counters = harness.counters();

    counters.increment_view("p1").await;

    let ttl = harness
        .kv
        .ttl(CacheKey::view_count("p1").as_str())
        .expect("view counter should expire");
    assert!(ttl <= harness.config.view_counter_ttl);

    harness.advance(harness.config.view_counter_ttl + Duration::from_secs(1));
    assert_eq!(counters.get_views("p1").await, 0);
    // The dirty marker outlives the counter; reconciliation skips it.
    assert!(counters.is_in_dirty_set("p1").await);
}

#[tokio::test]
async fn batch_read_matches_individual_reads() {
    let harness = Harness::new();
    let counters = harness.counters();

    for _ in 0..3 {
        counters.increment_view("a").await;
    }
    counters.increment_view("b").await;

    let post_ids = ids(&["a", "b", "c", "a"]);
    let batch = counters.get_multiple_views(&post_ids).await;

    assert_eq!(batch.len(), 3);
    for id in &post_ids {
        assert_eq!(batch[id], counters.get_views(id).await, "post {id}");
    }
    assert_eq!(batch["c"], 0);
}

#[tokio::test]
async fn batch_read_of_nothing_skips_the_store() {
    let harness = Harness::new();
    let counters = harness.counters();

    let before = harness.kv.round_trips();
    let batch = counters.get_multiple_views(&[]).await;

    assert!(batch.is_empty());
    assert_eq!(harness.kv.round_trips(), before);
}

#[tokio::test]
async fn shares_and_clicks_are_counted_per_platform() {
    let harness = Harness::new();
    let counters = harness.counters();
    let twitter = Platform::parse("Twitter").expect("platform");
    let email = Platform::parse("email").expect("platform");

    counters.increment_share("p1", &twitter).await;
    counters.increment_share("p1", &twitter).await;
    counters.increment_click("p1", &twitter).await;
    counters.increment_share("p1", &email).await;

    let stats = counters.get_stats("p1", &twitter).await;
    assert_eq!(stats.platform, "twitter");
    assert_eq!((stats.shares, stats.clicks), (2, 1));

    let stats = counters.get_stats("p1", &email).await;
    assert_eq!((stats.shares, stats.clicks), (1, 0));

    // Share statistics never mark the post for reconciliation.
    assert!(!counters.is_in_dirty_set("p1").await);
}

#[tokio::test]
async fn store_outage_reads_as_zero() {
    let harness = Harness::new();
    let counters = harness.counters();
    counters.increment_view("p1").await;

    harness.kv.set_unavailable(true);

    assert_eq!(counters.increment_view("p1").await, 0);
    assert_eq!(counters.get_views("p1").await, 0);
    assert!(!counters.is_in_dirty_set("p1").await);
    let batch = counters.get_multiple_views(&ids(&["p1", "p2"])).await;
    assert_eq!(batch.values().copied().collect::<Vec<_>>(), vec![0, 0]);
    assert!(counters.dirty_post_ids().await.is_err());

    harness.kv.set_unavailable(false);
    assert_eq!(counters.get_views("p1").await, 1);
}
