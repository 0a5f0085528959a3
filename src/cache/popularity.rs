//! Tag popularity tracking.
//!
//! Three structures mirror the durable `tags` table:
//!
//! - `tags:counts`, a hash of name to count,
//! - `tags:ranked`, a sorted set scored by count,
//! - `tags:names`, the searchable names (positive count or still referenced).
//!
//! Writes go to the cache first and the durable store second. The durable
//! count is authoritative; when the two disagree the cache is overwritten.
//!
//! A full sync also writes `tags:synced`. Reads that find the marker missing
//! (never synced, flushed, or not re-synced within a day) rebuild first, so a
//! partially repopulated hash is never served as the whole picture.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use super::{
    keys::CacheKey,
    kv::{KvError, KvExt, KvStore, Pipeline, Slot, report_kv_error},
};
use crate::{
    application::repos::{RepoError, TagsRepo},
    domain::{
        entities::TagCount,
        values::{TagName, normalise_prefix},
    },
};

const SYNC_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum PopularityError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Kv(#[from] KvError),
}

pub struct PopularityTracker {
    kv: Arc<dyn KvStore>,
    tags: Arc<dyn TagsRepo>,
}

impl PopularityTracker {
    pub fn new(kv: Arc<dyn KvStore>, tags: Arc<dyn TagsRepo>) -> Self {
        Self { kv, tags }
    }

    /// Record one more use of `name`. Returns the durable count.
    pub async fn increment(&self, name: &TagName) -> Result<u64, PopularityError> {
        let mut pipeline = Pipeline::atomic();
        let cached = pipeline.hash_incr_by(CacheKey::tag_counts(), name.as_str(), 1);
        pipeline.set_add(CacheKey::tag_names(), name.as_str());
        pipeline.zset_incr_by(CacheKey::tag_ranked(), name.as_str(), 1.0);
        let cached = self.run_counted(pipeline, cached, "popularity.increment").await;

        let durable = self.tags.increment_tag(name).await?;
        if cached != Some(durable) {
            self.overwrite(name, durable).await;
        }
        Ok(durable)
    }

    /// Record one fewer use of `name`. Returns the durable count.
    ///
    /// At zero the name leaves the count hash and ranking. It leaves the
    /// searchable set only if the durable row could be deleted, which fails
    /// while a post still references the tag.
    pub async fn decrement(&self, name: &TagName) -> Result<u64, PopularityError> {
        let mut pipeline = Pipeline::atomic();
        let cached = pipeline.hash_incr_by(CacheKey::tag_counts(), name.as_str(), -1);
        pipeline.zset_incr_by(CacheKey::tag_ranked(), name.as_str(), -1.0);
        let cached = self
            .run_signed(pipeline, cached, "popularity.decrement")
            .await;

        if cached.is_some_and(|value| value < 0) {
            self.overwrite(name, 0).await;
        }

        let durable = self.tags.decrement_tag(name).await?;
        if durable > 0 {
            if cached != i64::try_from(durable).ok() {
                self.overwrite(name, durable).await;
            }
            return Ok(durable);
        }

        let mut pipeline = Pipeline::atomic();
        pipeline.hash_del(CacheKey::tag_counts(), name.as_str());
        pipeline.zset_remove(CacheKey::tag_ranked(), name.as_str());
        if let Err(err) = self.kv.execute(pipeline).await {
            report_kv_error("popularity.decrement_cleanup", name.as_str(), &err);
        }

        if self.tags.delete_tag_if_unused(name).await? {
            let mut pipeline = Pipeline::new();
            pipeline.set_remove(CacheKey::tag_names(), name.as_str());
            if let Err(err) = self.kv.execute(pipeline).await {
                report_kv_error("popularity.decrement_unlist", name.as_str(), &err);
            }
        }
        Ok(0)
    }

    /// Most used tags, highest count first, ties by name. Rebuilds from the
    /// durable store when the cache is cold.
    pub async fn popular(&self, limit: usize) -> Vec<TagCount> {
        if limit == 0 {
            return Vec::new();
        }

        self.ensure_synced().await;
        let counts = self.read_counts().await;

        let mut tags: Vec<TagCount> = counts
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(name, count)| TagCount {
                name,
                count: u64::try_from(count).unwrap_or(0),
            })
            .collect();
        tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        tags.truncate(limit);
        tags
    }

    /// Searchable names starting with `prefix`, most used first.
    ///
    /// The prefix filter runs client side over the whole name set.
    pub async fn search(&self, prefix: &str, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.ensure_synced().await;
        let names = self.read_names().await;

        let prefix = normalise_prefix(prefix);
        let candidates: Vec<String> = names
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let scores = self.scores_for(&candidates).await;
        let mut ranked: Vec<(String, f64)> = candidates
            .into_iter()
            .map(|name| {
                let score = scores.get(&name).copied().unwrap_or(0.0);
                (name, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked.into_iter().map(|(name, _)| name).collect()
    }

    /// Replace the cached structures with the durable state. Returns the
    /// number of tags with a positive count.
    pub async fn sync_from_durable(&self) -> Result<usize, PopularityError> {
        let active = self.tags.list_active_tags().await?;
        let searchable = self.tags.list_searchable_tag_names().await?;

        let counts = CacheKey::tag_counts();
        let ranked = CacheKey::tag_ranked();
        let names = CacheKey::tag_names();
        let synced = CacheKey::tag_synced();

        let mut pipeline = Pipeline::atomic();
        pipeline.del([&counts, &ranked, &names]);
        for tag in &active {
            let count = i64::try_from(tag.count).unwrap_or(i64::MAX);
            pipeline.hash_set(&counts, tag.name.as_str(), count);
            pipeline.zset_add(&ranked, tag.name.as_str(), tag.count as f64);
        }
        for name in &searchable {
            pipeline.set_add(&names, name.as_str());
        }
        pipeline.set_with_ttl(&synced, Bytes::from_static(b"1"), SYNC_MARKER_TTL);
        self.kv.execute(pipeline).await?;

        info!(
            active = active.len(),
            searchable = searchable.len(),
            "rebuilt tag cache from durable store"
        );
        Ok(active.len())
    }

    /// Rebuild when the sync marker is missing. An unreachable store is left
    /// alone since a rebuild could not be written anyway.
    async fn ensure_synced(&self) {
        let key = CacheKey::tag_synced();
        match self.kv.get(key.as_str()).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(err) = self.sync_from_durable().await {
                    warn!(error = %err, "tag cache rebuild failed, serving cached results");
                }
            }
            Err(err) => report_kv_error("popularity.synced", key.as_str(), &err),
        }
    }

    async fn read_counts(&self) -> HashMap<String, i64> {
        let key = CacheKey::tag_counts();
        self.kv.hash_get_all(key.as_str()).await.unwrap_or_else(|err| {
            report_kv_error("popularity.read_counts", key.as_str(), &err);
            HashMap::new()
        })
    }

    async fn read_names(&self) -> Vec<String> {
        let key = CacheKey::tag_names();
        self.kv.set_members(key.as_str()).await.unwrap_or_else(|err| {
            report_kv_error("popularity.read_names", key.as_str(), &err);
            Vec::new()
        })
    }

    async fn scores_for(&self, names: &[String]) -> HashMap<String, f64> {
        let ranked = CacheKey::tag_ranked();
        let mut pipeline = Pipeline::new();
        let slots: Vec<_> = names
            .iter()
            .map(|name| (name, pipeline.zset_score(&ranked, name.as_str())))
            .collect();

        let mut replies = match self.kv.execute(pipeline).await {
            Ok(replies) => replies,
            Err(err) => {
                report_kv_error("popularity.scores", ranked.as_str(), &err);
                return HashMap::new();
            }
        };

        let mut scores = HashMap::with_capacity(slots.len());
        for (name, slot) in slots {
            match replies.take(slot) {
                Ok(Some(score)) => {
                    scores.insert(name.clone(), score);
                }
                Ok(None) => {}
                Err(err) => report_kv_error("popularity.scores", ranked.as_str(), &err),
            }
        }
        scores
    }

    /// Force the cached count and score of `name` to `count`.
    async fn overwrite(&self, name: &TagName, count: u64) {
        let mut pipeline = Pipeline::atomic();
        pipeline.hash_set(
            CacheKey::tag_counts(),
            name.as_str(),
            i64::try_from(count).unwrap_or(i64::MAX),
        );
        pipeline.zset_add(CacheKey::tag_ranked(), name.as_str(), count as f64);
        if count > 0 {
            pipeline.set_add(CacheKey::tag_names(), name.as_str());
        }
        if let Err(err) = self.kv.execute(pipeline).await {
            report_kv_error("popularity.overwrite", name.as_str(), &err);
        }
    }

    async fn run_signed(
        &self,
        pipeline: Pipeline,
        slot: Slot<i64>,
        op: &'static str,
    ) -> Option<i64> {
        let result = match self.kv.execute(pipeline).await {
            Ok(mut replies) => replies.take(slot),
            Err(err) => Err(err),
        };
        result
            .map_err(|err| report_kv_error(op, CacheKey::tag_counts().as_str(), &err))
            .ok()
    }

    async fn run_counted(
        &self,
        pipeline: Pipeline,
        slot: Slot<i64>,
        op: &'static str,
    ) -> Option<u64> {
        self.run_signed(pipeline, slot, op)
            .await
            .and_then(|value| u64::try_from(value).ok())
    }
}
