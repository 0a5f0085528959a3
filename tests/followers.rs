mod support;

use std::{sync::Arc, time::Duration};

use feedtally::{
    application::followers::FollowerService,
    cache::{CacheKey, Tier},
    domain::entities::FollowerInfo,
};
use support::Harness;

fn info(followers: u64, is_followed_by_user: bool) -> FollowerInfo {
    FollowerInfo {
        followers,
        is_followed_by_user,
    }
}

#[tokio::test]
async fn set_then_get_returns_the_same_projection() {
    let harness = Harness::new();
    let cache = harness.followers();

    cache.set("alice", Some("bob"), &info(42, true)).await;
    cache.set("alice", None, &info(42, false)).await;

    assert_eq!(cache.get("alice", Some("bob")).await, Some(info(42, true)));
    assert_eq!(cache.get("alice", None).await, Some(info(42, false)));
    assert_eq!(cache.get("alice", Some("carol")).await, None);
    assert!(cache.is_follower("alice", "bob").await);
    assert!(!cache.is_follower("alice", "carol").await);
}

#[tokio::test]
async fn backup_answers_after_primary_expires() {
    let harness = Harness::new();
    let cache = harness.followers();
    cache.set("alice", None, &info(7, false)).await;

    harness.advance(harness.config.follower_ttl + Duration::from_secs(1));
    assert!(
        !harness
            .kv
            .contains_key(CacheKey::follower_info("alice", None).as_str())
    );

    let (value, tier) = cache.get_with_tier("alice", None).await.expect("backup hit");
    assert_eq!(value, info(7, false));
    assert_eq!(tier, Tier::Backup);

    // The backup hit restores the primary copy.
    let (_, tier) = cache.get_with_tier("alice", None).await.expect("primary hit");
    assert_eq!(tier, Tier::Primary);
}

#[tokio::test]
async fn both_tiers_expire_eventually() {
    let harness = Harness::new();
    let cache = harness.followers();
    cache.set("alice", None, &info(7, false)).await;

    harness.advance(harness.config.follower_backup_ttl + Duration::from_secs(1));

    assert_eq!(cache.get("alice", None).await, None);
}

#[tokio::test]
async fn invalidating_a_viewer_drops_the_anonymous_projection() {
    let harness = Harness::new();
    let cache = harness.followers();
    cache.set("alice", Some("bob"), &info(3, true)).await;
    cache.set("alice", Some("carol"), &info(3, false)).await;
    cache.set("alice", None, &info(3, false)).await;

    cache.invalidate("alice", Some("bob")).await;

    assert_eq!(cache.get("alice", Some("bob")).await, None);
    assert_eq!(cache.get("alice", None).await, None);
    assert!(!cache.is_follower("alice", "bob").await);
    // Other named viewers keep their projection until it expires.
    assert_eq!(cache.get("alice", Some("carol")).await, Some(info(3, false)));
}

#[tokio::test]
async fn store_outage_reads_as_a_miss() {
    let harness = Harness::new();
    let cache = harness.followers();
    cache.set("alice", None, &info(1, false)).await;

    harness.kv.set_unavailable(true);
    assert_eq!(cache.get("alice", None).await, None);
    cache.set("alice", None, &info(2, false)).await;

    harness.kv.set_unavailable(false);
    assert_eq!(cache.get("alice", None).await, Some(info(1, false)));
}

#[tokio::test]
async fn service_reads_through_and_caches() {
    let harness = Harness::new();
    harness.repos.follow("bob", "alice");
    harness.repos.follow("carol", "alice");
    let service = FollowerService::new(harness.followers(), harness.repos.clone());

    let first = service
        .follower_info("alice", Some("bob"))
        .await
        .expect("durable read");
    assert_eq!(first, info(2, true));
    assert_eq!(harness.repos.follower_reads(), 1);

    let second = service
        .follower_info("alice", Some("bob"))
        .await
        .expect("cached read");
    assert_eq!(second, first);
    assert_eq!(harness.repos.follower_reads(), 1);
}

#[tokio::test]
async fn relationship_change_forces_a_fresh_read() {
    let harness = Harness::new();
    harness.repos.follow("bob", "alice");
    let service = FollowerService::new(harness.followers(), harness.repos.clone());

    assert!(service.is_following("alice", "bob").await.expect("follows"));
    let anonymous = service.follower_info("alice", None).await.expect("anon");
    assert_eq!(anonymous.followers, 1);

    harness.repos.unfollow("bob", "alice");
    service.relationship_changed("alice", "bob").await;

    assert!(!service.is_following("alice", "bob").await.expect("unfollowed"));
    let anonymous = service.follower_info("alice", None).await.expect("anon");
    assert_eq!(anonymous.followers, 0);
}

#[tokio::test]
async fn durable_failure_surfaces_on_a_miss() {
    let harness = Harness::new();
    let repos = Arc::clone(&harness.repos);
    let service = FollowerService::new(harness.followers(), repos);

    harness.repos.set_unavailable(true);

    assert!(service.follower_info("alice", None).await.is_err());
}
