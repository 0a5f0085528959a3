//! View counters and share/click statistics.
//!
//! View increments also mark the post in the dirty set, which is what the
//! reconciliation job drains. Share and click counters live only in the
//! cache and expire independently per (post, platform).

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use metrics::counter;

use super::{
    codec::decode_counter,
    config::CacheConfig,
    keys::CacheKey,
    kv::{KvError, KvExt, KvStore, Pipeline, report_kv_error},
};
use crate::domain::{entities::ShareStat, values::Platform};

pub(crate) const METRIC_VIEW_INCREMENT_TOTAL: &str = "feedtally_view_increment_total";

pub struct CounterAggregator {
    kv: Arc<dyn KvStore>,
    view_ttl: Duration,
    share_ttl: Duration,
}

impl CounterAggregator {
    pub fn new(kv: Arc<dyn KvStore>, config: &CacheConfig) -> Self {
        Self {
            kv,
            view_ttl: config.view_counter_ttl,
            share_ttl: config.share_stat_ttl,
        }
    }

    /// Count one view and mark the post dirty. Returns the new total, or 0
    /// when the store is unreachable.
    pub async fn increment_view(&self, post_id: &str) -> u64 {
        let key = CacheKey::view_count(post_id);
        let mut pipeline = Pipeline::atomic();
        pipeline.set_add(CacheKey::views_dirty(), post_id);
        let total = pipeline.incr_by(&key, 1);
        pipeline.expire(&key, self.view_ttl);

        let result = match self.kv.execute(pipeline).await {
            Ok(mut replies) => replies.take(total),
            Err(err) => Err(err),
        };
        match result {
            Ok(value) => {
                counter!(METRIC_VIEW_INCREMENT_TOTAL).increment(1);
                clamp(value)
            }
            Err(err) => {
                report_kv_error("counters.increment_view", key.as_str(), &err);
                0
            }
        }
    }

    /// Cached view count; 0 when absent.
    pub async fn get_views(&self, post_id: &str) -> u64 {
        let key = CacheKey::view_count(post_id);
        match self.kv.get(key.as_str()).await {
            Ok(bytes) => bytes.as_deref().and_then(decode_counter).unwrap_or(0),
            Err(err) => {
                report_kv_error("counters.get_views", key.as_str(), &err);
                0
            }
        }
    }

    /// View counts for every id in one round trip. Absent counters read as 0.
    pub async fn get_multiple_views(&self, post_ids: &[String]) -> HashMap<String, u64> {
        match self.cached_views(post_ids).await {
            Ok(found) => found
                .into_iter()
                .map(|(id, count)| (id, count.unwrap_or(0)))
                .collect(),
            Err(err) => {
                report_kv_error("counters.get_multiple_views", "views:*", &err);
                post_ids.iter().map(|id| (id.clone(), 0)).collect()
            }
        }
    }

    /// Raw cached counters, `None` where the key is missing. An empty input
    /// never touches the store.
    pub async fn cached_views(
        &self,
        post_ids: &[String],
    ) -> Result<HashMap<String, Option<u64>>, KvError> {
        let unique: BTreeSet<&String> = post_ids.iter().collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let mut pipeline = Pipeline::new();
        let slots: Vec<_> = unique
            .into_iter()
            .map(|id| (id, pipeline.get(CacheKey::view_count(id))))
            .collect();
        let mut replies = self.kv.execute(pipeline).await?;

        let mut counts = HashMap::with_capacity(slots.len());
        for (id, slot) in slots {
            let count = replies.take(slot)?.as_deref().and_then(decode_counter);
            counts.insert(id.clone(), count);
        }
        Ok(counts)
    }

    pub async fn is_in_dirty_set(&self, post_id: &str) -> bool {
        let key = CacheKey::views_dirty();
        match self.kv.set_is_member(key.as_str(), post_id).await {
            Ok(member) => member,
            Err(err) => {
                report_kv_error("counters.is_in_dirty_set", key.as_str(), &err);
                false
            }
        }
    }

    /// Post ids awaiting reconciliation.
    pub async fn dirty_post_ids(&self) -> Result<Vec<String>, KvError> {
        self.kv.set_members(CacheKey::views_dirty().as_str()).await
    }

    /// Remove reconciled ids from the dirty set, unless their counter moved
    /// since it was read. `seen` pairs each id with the counter value the
    /// caller reconciled (`None` for an absent counter). The SREM and the
    /// re-read run as one atomic batch; ids whose counter changed are marked
    /// dirty again and returned.
    pub async fn clear_dirty_unless_changed(
        &self,
        seen: &[(String, Option<u64>)],
    ) -> Result<Vec<String>, KvError> {
        if seen.is_empty() {
            return Ok(Vec::new());
        }
        let dirty = CacheKey::views_dirty();
        let mut pipeline = Pipeline::atomic();
        let slots: Vec<_> = seen
            .iter()
            .map(|(id, _)| {
                pipeline.set_remove(&dirty, id.as_str());
                pipeline.get(CacheKey::view_count(id))
            })
            .collect();
        let mut replies = self.kv.execute(pipeline).await?;

        let mut changed = Vec::new();
        for ((id, expected), slot) in seen.iter().zip(slots) {
            let current = replies.take(slot)?.as_deref().and_then(decode_counter);
            if current != *expected {
                changed.push(id.clone());
            }
        }
        if !changed.is_empty() {
            let mut pipeline = Pipeline::new();
            for id in &changed {
                pipeline.set_add(&dirty, id.as_str());
            }
            self.kv.execute(pipeline).await?;
        }
        Ok(changed)
    }

    pub async fn increment_share(&self, post_id: &str, platform: &Platform) -> u64 {
        self.bump(
            CacheKey::share_count(post_id, platform.as_str()),
            "counters.increment_share",
        )
        .await
    }

    pub async fn increment_click(&self, post_id: &str, platform: &Platform) -> u64 {
        self.bump(
            CacheKey::click_count(post_id, platform.as_str()),
            "counters.increment_click",
        )
        .await
    }

    /// Shares and clicks of one (post, platform) pair, read together.
    pub async fn get_stats(&self, post_id: &str, platform: &Platform) -> ShareStat {
        let shares_key = CacheKey::share_count(post_id, platform.as_str());
        let mut pipeline = Pipeline::new();
        let shares = pipeline.get(&shares_key);
        let clicks = pipeline.get(CacheKey::click_count(post_id, platform.as_str()));

        let read = async {
            let mut replies = self.kv.execute(pipeline).await?;
            let shares = replies.take(shares)?;
            let clicks = replies.take(clicks)?;
            Ok::<_, KvError>((shares, clicks))
        };

        let (shares, clicks) = match read.await {
            Ok((shares, clicks)) => (
                shares.as_deref().and_then(decode_counter).unwrap_or(0),
                clicks.as_deref().and_then(decode_counter).unwrap_or(0),
            ),
            Err(err) => {
                report_kv_error("counters.get_stats", shares_key.as_str(), &err);
                (0, 0)
            }
        };

        ShareStat {
            post_id: post_id.to_string(),
            platform: platform.as_str().to_string(),
            shares,
            clicks,
        }
    }

    async fn bump(&self, key: CacheKey, op: &'static str) -> u64 {
        let mut pipeline = Pipeline::new();
        let total = pipeline.incr_by(&key, 1);
        pipeline.expire(&key, self.share_ttl);

        let result = match self.kv.execute(pipeline).await {
            Ok(mut replies) => replies.take(total),
            Err(err) => Err(err),
        };
        match result {
            Ok(value) => clamp(value),
            Err(err) => {
                report_kv_error(op, key.as_str(), &err);
                0
            }
        }
    }
}

fn clamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
