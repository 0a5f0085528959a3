//! In-process durable store used by tests and dry runs.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use crate::{
    application::repos::{FollowersRepo, RepoError, TagsRepo, TrendingSource, ViewsRepo},
    domain::{
        entities::{FollowerInfo, TagCount, TrendingTopic, ViewCounter},
        values::TagName,
    },
};

#[derive(Debug, Default)]
struct Tables {
    /// (follower, followee)
    follows: BTreeSet<(String, String)>,
    tags: BTreeMap<String, u64>,
    /// (post, tag)
    post_tags: BTreeSet<(String, String)>,
    posts: HashMap<String, OffsetDateTime>,
    view_counts: HashMap<String, u64>,
    ignored_view_writes: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryRepositories {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    view_write_batches: AtomicUsize,
    follower_reads: AtomicUsize,
}

impl InMemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a durable-store outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn follow(&self, follower_id: &str, followee_id: &str) {
        self.lock("follow")
            .follows
            .insert((follower_id.to_string(), followee_id.to_string()));
    }

    pub fn unfollow(&self, follower_id: &str, followee_id: &str) {
        self.lock("unfollow")
            .follows
            .remove(&(follower_id.to_string(), followee_id.to_string()));
    }

    pub fn add_post(&self, post_id: &str, created_at: OffsetDateTime) {
        self.lock("add_post")
            .posts
            .insert(post_id.to_string(), created_at);
    }

    pub fn tag_post(&self, post_id: &str, tag: &TagName) {
        self.lock("tag_post")
            .post_tags
            .insert((post_id.to_string(), tag.as_str().to_string()));
    }

    pub fn set_tag_count(&self, tag: &TagName, count: u64) {
        self.lock("set_tag_count")
            .tags
            .insert(tag.as_str().to_string(), count);
    }

    /// Durable count of `tag`; `None` when the row does not exist.
    pub fn tag_count(&self, tag: &TagName) -> Option<u64> {
        self.lock("tag_count").tags.get(tag.as_str()).copied()
    }

    pub fn view_count(&self, post_id: &str) -> Option<u64> {
        self.lock("view_count").view_counts.get(post_id).copied()
    }

    /// Accept writes for `post_id` without persisting them, so the
    /// verification read sees a different value.
    pub fn ignore_view_writes_for(&self, post_id: &str) {
        self.lock("ignore_view_writes_for")
            .ignored_view_writes
            .insert(post_id.to_string());
    }

    /// Number of committed view-count transactions.
    pub fn view_write_batches(&self) -> usize {
        self.view_write_batches.load(Ordering::SeqCst)
    }

    /// Number of follower lookups served.
    pub fn follower_reads(&self) -> usize {
        self.follower_reads.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), RepoError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence(
                "in-memory durable store is marked unavailable",
            ));
        }
        Ok(())
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    "Recovered from poisoned in-memory repository lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[async_trait]
impl FollowersRepo for InMemoryRepositories {
    async fn follower_info(
        &self,
        user_id: &str,
        viewer_id: Option<&str>,
    ) -> Result<FollowerInfo, RepoError> {
        self.check_available()?;
        self.follower_reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.lock("follower_info");
        let followers = tables
            .follows
            .iter()
            .filter(|(_, followee)| followee == user_id)
            .count();
        let is_followed_by_user = viewer_id.is_some_and(|viewer| {
            tables
                .follows
                .contains(&(viewer.to_string(), user_id.to_string()))
        });
        Ok(FollowerInfo {
            followers: u64::try_from(followers).unwrap_or(u64::MAX),
            is_followed_by_user,
        })
    }
}

#[async_trait]
impl TagsRepo for InMemoryRepositories {
    async fn increment_tag(&self, name: &TagName) -> Result<u64, RepoError> {
        self.check_available()?;
        let mut tables = self.lock("increment_tag");
        let count = tables.tags.entry(name.as_str().to_string()).or_insert(0);
        *count = count.saturating_add(1);
        Ok(*count)
    }

    async fn decrement_tag(&self, name: &TagName) -> Result<u64, RepoError> {
        self.check_available()?;
        let mut tables = self.lock("decrement_tag");
        match tables.tags.get_mut(name.as_str()) {
            Some(count) => {
                *count = count.saturating_sub(1);
                Ok(*count)
            }
            None => Ok(0),
        }
    }

    async fn delete_tag_if_unused(&self, name: &TagName) -> Result<bool, RepoError> {
        self.check_available()?;
        let mut tables = self.lock("delete_tag_if_unused");
        let referenced = tables
            .post_tags
            .iter()
            .any(|(_, tag)| tag == name.as_str());
        let zero = tables.tags.get(name.as_str()) == Some(&0);
        if zero && !referenced {
            tables.tags.remove(name.as_str());
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_active_tags(&self) -> Result<Vec<TagCount>, RepoError> {
        self.check_available()?;
        let tables = self.lock("list_active_tags");
        Ok(tables
            .tags
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, count)| TagCount {
                name: name.clone(),
                count: *count,
            })
            .collect())
    }

    async fn list_searchable_tag_names(&self) -> Result<Vec<String>, RepoError> {
        self.check_available()?;
        let tables = self.lock("list_searchable_tag_names");
        let mut names: BTreeSet<String> = tables
            .tags
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.extend(tables.post_tags.iter().map(|(_, tag)| tag.clone()));
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl ViewsRepo for InMemoryRepositories {
    async fn write_view_counts(&self, counts: &[ViewCounter]) -> Result<(), RepoError> {
        self.check_available()?;
        let mut tables = self.lock("write_view_counts");
        for counter in counts {
            if tables.ignored_view_writes.contains(&counter.post_id) {
                continue;
            }
            tables
                .view_counts
                .insert(counter.post_id.clone(), counter.count);
        }
        self.view_write_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_view_counts(
        &self,
        post_ids: &[String],
    ) -> Result<HashMap<String, u64>, RepoError> {
        self.check_available()?;
        let tables = self.lock("read_view_counts");
        Ok(post_ids
            .iter()
            .filter_map(|id| {
                tables
                    .view_counts
                    .get(id)
                    .map(|count| (id.clone(), *count))
            })
            .collect())
    }
}

#[async_trait]
impl TrendingSource for InMemoryRepositories {
    async fn trending_topics(
        &self,
        since: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<TrendingTopic>, RepoError> {
        self.check_available()?;
        let tables = self.lock("trending_topics");
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for (post_id, tag) in &tables.post_tags {
            let recent = tables
                .posts
                .get(post_id)
                .is_some_and(|created_at| *created_at >= since);
            if recent {
                *counts.entry(tag.as_str()).or_insert(0) += 1;
            }
        }

        let mut topics: Vec<TrendingTopic> = counts
            .into_iter()
            .map(|(hashtag, count)| TrendingTopic {
                hashtag: hashtag.to_string(),
                count,
            })
            .collect();
        topics.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.hashtag.cmp(&b.hashtag)));
        topics.truncate(limit);
        Ok(topics)
    }
}
