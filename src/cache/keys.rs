//! Cache key definitions.
//!
//! Every key is `namespace:id[:suffix]`, built only through the constructors on
//! [`CacheKey`]. Id segments are escaped so a `:` inside an id can never be
//! confused with the separator.

use std::fmt;

const FOLLOWER_INFO: &str = "follower_info";
const FOLLOWER_INFO_BACKUP: &str = "follower_info_backup";
const FOLLOWERS_OF: &str = "followers_of";
const VIEWS: &str = "views";
const VIEWS_DIRTY: &str = "views_dirty";
const SHARE_STATS: &str = "share_stats";
const TAGS: &str = "tags";
const TRENDING: &str = "trending";
const SEARCH: &str = "search";

const ANONYMOUS_VIEWER: &str = "anon";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    fn build(namespace: &str, segments: &[&str]) -> Self {
        let mut key = String::from(namespace);
        for segment in segments {
            key.push(':');
            key.push_str(segment);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    // Follower relationship state

    /// Primary copy of the follower projection for `user_id` as seen by `viewer_id`.
    pub fn follower_info(user_id: &str, viewer_id: Option<&str>) -> Self {
        Self::build(
            FOLLOWER_INFO,
            &[&escape(user_id), &viewer_segment(viewer_id)],
        )
    }

    pub fn follower_info_backup(user_id: &str, viewer_id: Option<&str>) -> Self {
        Self::build(
            FOLLOWER_INFO_BACKUP,
            &[&escape(user_id), &viewer_segment(viewer_id)],
        )
    }

    /// Set of viewer ids known to follow `user_id`.
    pub fn followers_of(user_id: &str) -> Self {
        Self::build(FOLLOWERS_OF, &[&escape(user_id)])
    }

    // Counters

    pub fn view_count(post_id: &str) -> Self {
        Self::build(VIEWS, &[&escape(post_id)])
    }

    /// Set of post ids whose view counters await reconciliation.
    pub fn views_dirty() -> Self {
        Self::build(VIEWS_DIRTY, &[])
    }

    pub fn share_count(post_id: &str, platform: &str) -> Self {
        Self::build(
            SHARE_STATS,
            &[&escape(post_id), &escape(platform), "shares"],
        )
    }

    pub fn click_count(post_id: &str, platform: &str) -> Self {
        Self::build(
            SHARE_STATS,
            &[&escape(post_id), &escape(platform), "clicks"],
        )
    }

    // Tag popularity

    pub fn tag_counts() -> Self {
        Self::build(TAGS, &["counts"])
    }

    pub fn tag_names() -> Self {
        Self::build(TAGS, &["names"])
    }

    pub fn tag_ranked() -> Self {
        Self::build(TAGS, &["ranked"])
    }

    /// Present while the tag structures hold a full copy of the durable table.
    pub fn tag_synced() -> Self {
        Self::build(TAGS, &["synced"])
    }

    // Trending topics

    pub fn trending_topics() -> Self {
        Self::build(TRENDING, &["topics"])
    }

    pub fn trending_topics_backup() -> Self {
        Self::build(TRENDING, &["topics", "backup"])
    }

    pub fn trending_last_updated() -> Self {
        Self::build(TRENDING, &["last_updated"])
    }

    /// Short-lived claim held by whoever is recomputing the trending list.
    pub fn trending_refreshing() -> Self {
        Self::build(TRENDING, &["refreshing"])
    }

    // Search

    pub fn search_suggestions() -> Self {
        Self::build(SEARCH, &["suggestions"])
    }

    pub fn search_history(user_id: &str) -> Self {
        Self::build(SEARCH, &["history", &escape(user_id)])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl From<&CacheKey> for String {
    fn from(key: &CacheKey) -> Self {
        key.0.clone()
    }
}

fn viewer_segment(viewer_id: Option<&str>) -> String {
    match viewer_id {
        Some(viewer) => format!("u.{}", escape(viewer)),
        None => ANONYMOUS_VIEWER.to_string(),
    }
}

fn escape(segment: &str) -> String {
    if !segment.contains(['%', ':']) {
        return segment.to_string();
    }
    segment.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(CacheKey::view_count("p1"), CacheKey::view_count("p1"));
        assert_eq!(CacheKey::view_count("p1").as_str(), "views:p1");
        assert_eq!(
            CacheKey::follower_info("alice", Some("bob")).as_str(),
            "follower_info:alice:u.bob"
        );
        assert_eq!(
            CacheKey::follower_info("alice", None).as_str(),
            "follower_info:alice:anon"
        );
    }

    #[test]
    fn colons_in_ids_do_not_collide() {
        let nested = CacheKey::share_count("a:b", "c");
        let flat = CacheKey::share_count("a", "b:c");
        assert_ne!(nested, flat);
    }

    #[test]
    fn anonymous_viewer_is_distinct_from_named_viewer() {
        assert_ne!(
            CacheKey::follower_info("alice", None),
            CacheKey::follower_info("alice", Some("anon"))
        );
    }

    #[test]
    fn dirty_set_never_matches_a_post_counter() {
        let keys: HashSet<_> = ["dirty", "views_dirty", ""]
            .iter()
            .map(|id| CacheKey::view_count(id))
            .collect();
        assert!(!keys.contains(&CacheKey::views_dirty()));
        assert_eq!(CacheKey::views_dirty().as_str(), "views_dirty");
    }

    #[test]
    fn primary_and_backup_use_separate_namespaces() {
        let primary = CacheKey::follower_info("alice", Some("backup"));
        let backup = CacheKey::follower_info_backup("alice", None);
        assert_ne!(primary.as_str(), backup.as_str());
    }
}
