mod support;

use std::{collections::HashSet, sync::Arc, time::Duration};

use feedtally::{
    application::jobs::ReconcileJob, cache::TrendingCache, domain::entities::FollowerInfo,
};
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;
use support::Harness;

#[tokio::test]
#[serial]
async fn engagement_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let harness = Harness::new();
    let counters = harness.counters();
    counters.increment_view("p1").await;
    counters.increment_view("p1").await;

    // Hit on both tiers, then a miss.
    let followers = harness.followers();
    followers
        .set(
            "alice",
            None,
            &FollowerInfo {
                followers: 1,
                is_followed_by_user: false,
            },
        )
        .await;
    followers.get("alice", None).await;
    harness.advance(harness.config.follower_ttl + Duration::from_secs(1));
    followers.get("alice", None).await;
    followers.get("nobody", None).await;

    let job = ReconcileJob::new(Arc::clone(&counters), harness.repos.clone(), 10);
    job.run().await.expect("reconcile");

    let trending = TrendingCache::new(
        harness.kv_store(),
        harness.repos.clone(),
        harness.clock(),
        &harness.config,
    );
    trending.warm_cache().await;

    harness.kv.set_unavailable(true);
    counters.get_views("p1").await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "feedtally_view_increment_total",
        "feedtally_cache_hit_total",
        "feedtally_cache_miss_total",
        "feedtally_reconcile_flushed_total",
        "feedtally_reconcile_ms",
        "feedtally_trending_refresh_total",
        "feedtally_kv_error_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
