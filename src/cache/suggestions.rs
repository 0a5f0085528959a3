//! Search suggestions and per-user search history.

use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;

use super::{
    clock::Clock,
    config::CacheConfig,
    keys::CacheKey,
    kv::{KvExt, KvStore, Order, Pipeline, report_kv_error},
};
use crate::domain::{
    entities::{SearchHistoryEntry, SearchSuggestion},
    values::SearchQuery,
};

pub struct SuggestionIndex {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    suggestions_ttl: Duration,
    suggestions_limit: usize,
    history_ttl: Duration,
    history_limit: usize,
    scan_page_size: usize,
}

impl SuggestionIndex {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self {
            kv,
            clock,
            suggestions_ttl: config.suggestions_ttl,
            suggestions_limit: config.suggestions_limit,
            history_ttl: config.history_ttl,
            history_limit: config.history_limit,
            scan_page_size: config.scan_page_size,
        }
    }

    /// Count one search for `query` in the global table. Blank queries are ignored.
    pub async fn add_suggestion(&self, query: &str) {
        let Some(query) = SearchQuery::parse(query) else {
            return;
        };
        let mut pipeline = Pipeline::new();
        self.queue_suggestion(&mut pipeline, &query);
        self.run(pipeline, "suggestions.add", CacheKey::search_suggestions())
            .await;
    }

    /// Global suggestions starting with `prefix`, most searched first.
    pub async fn get_suggestions(&self, prefix: &str, limit: usize) -> Vec<SearchSuggestion> {
        if limit == 0 {
            return Vec::new();
        }
        let key = CacheKey::search_suggestions();
        let entries = match self.kv.zset_scan(key.as_str(), self.scan_page_size).await {
            Ok(entries) => entries,
            Err(err) => {
                report_kv_error("suggestions.get", key.as_str(), &err);
                return Vec::new();
            }
        };

        let prefix = SearchQuery::parse(prefix);
        let prefix = prefix.as_ref().map(SearchQuery::as_str).unwrap_or("");
        let mut suggestions: Vec<SearchSuggestion> = entries
            .into_iter()
            .filter(|(query, _)| query.starts_with(prefix))
            .map(|(query, score)| SearchSuggestion {
                query,
                count: score_to_count(score),
            })
            .collect();
        suggestions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.query.cmp(&b.query)));
        suggestions.truncate(limit);
        suggestions
    }

    /// Remember `query` as the most recent search of `user_id`.
    pub async fn add_to_history(&self, user_id: &str, query: &str) {
        let Some(query) = SearchQuery::parse(query) else {
            return;
        };
        let mut pipeline = Pipeline::new();
        self.queue_history(&mut pipeline, user_id, &query);
        self.run(pipeline, "suggestions.add_history", CacheKey::search_history(user_id))
            .await;
    }

    /// Recorded searches of `user_id`, most recent first.
    pub async fn get_history(&self, user_id: &str) -> Vec<String> {
        self.get_history_entries(user_id)
            .await
            .into_iter()
            .map(|entry| entry.query)
            .collect()
    }

    /// Like [`SuggestionIndex::get_history`], with the time of each search.
    pub async fn get_history_entries(&self, user_id: &str) -> Vec<SearchHistoryEntry> {
        if self.history_limit == 0 {
            return Vec::new();
        }
        let key = CacheKey::search_history(user_id);
        let stop = isize::try_from(self.history_limit - 1).unwrap_or(isize::MAX);
        match self.kv.zset_range(key.as_str(), 0, stop, Order::Desc).await {
            Ok(entries) => entries
                .into_iter()
                .map(|(query, score)| SearchHistoryEntry {
                    query,
                    searched_at: millis_to_time(score),
                })
                .collect(),
            Err(err) => {
                report_kv_error("suggestions.get_history", key.as_str(), &err);
                Vec::new()
            }
        }
    }

    pub async fn remove_history_item(&self, user_id: &str, query: &str) {
        let Some(query) = SearchQuery::parse(query) else {
            return;
        };
        let key = CacheKey::search_history(user_id);
        let mut pipeline = Pipeline::new();
        pipeline.zset_remove(&key, query.as_str());
        self.run(pipeline, "suggestions.remove_history", key).await;
    }

    pub async fn clear_history(&self, user_id: &str) {
        let key = CacheKey::search_history(user_id);
        let mut pipeline = Pipeline::new();
        pipeline.del([&key]);
        self.run(pipeline, "suggestions.clear_history", key).await;
    }

    /// Count the search globally and, for a signed-in user, add it to their
    /// history, in one round trip.
    pub async fn record_search(&self, user_id: Option<&str>, query: &str) {
        let Some(query) = SearchQuery::parse(query) else {
            return;
        };
        let mut pipeline = Pipeline::new();
        self.queue_suggestion(&mut pipeline, &query);
        if let Some(user_id) = user_id {
            self.queue_history(&mut pipeline, user_id, &query);
        }
        self.run(pipeline, "suggestions.record", CacheKey::search_suggestions())
            .await;
    }

    fn queue_suggestion(&self, pipeline: &mut Pipeline, query: &SearchQuery) {
        let key = CacheKey::search_suggestions();
        pipeline.zset_incr_by(&key, query.as_str(), 1.0);
        pipeline.zset_remove_range_by_rank(&key, 0, keep_top(self.suggestions_limit));
        pipeline.expire(&key, self.suggestions_ttl);
    }

    fn queue_history(&self, pipeline: &mut Pipeline, user_id: &str, query: &SearchQuery) {
        let key = CacheKey::search_history(user_id);
        let score = time_to_millis(self.clock.now());
        pipeline.zset_add(&key, query.as_str(), score);
        pipeline.zset_remove_range_by_rank(&key, 0, keep_top(self.history_limit));
        pipeline.expire(&key, self.history_ttl);
    }

    async fn run(&self, pipeline: Pipeline, op: &'static str, key: CacheKey) {
        if let Err(err) = self.kv.execute(pipeline).await {
            report_kv_error(op, key.as_str(), &err);
        }
    }
}

/// Stop rank for ZREMRANGEBYRANK that keeps only the `keep` highest scores.
fn keep_top(keep: usize) -> isize {
    -(isize::try_from(keep).unwrap_or(isize::MAX - 1)) - 1
}

fn score_to_count(score: f64) -> u64 {
    if score.is_finite() && score > 0.0 {
        score.round() as u64
    } else {
        0
    }
}

fn time_to_millis(at: OffsetDateTime) -> f64 {
    (at.unix_timestamp_nanos() / 1_000_000) as f64
}

fn millis_to_time(score: f64) -> OffsetDateTime {
    let nanos = (score as i128).saturating_mul(1_000_000);
    OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn keep_top_targets_everything_below_the_cap() {
        assert_eq!(keep_top(100), -101);
        assert_eq!(keep_top(0), -1);
    }

    #[test]
    fn history_scores_round_trip_through_millis() {
        let at = datetime!(2024-04-01 10:20:30.456 UTC);
        assert_eq!(millis_to_time(time_to_millis(at)), at);
    }

    #[test]
    fn odd_scores_never_become_huge_counts() {
        assert_eq!(score_to_count(-3.0), 0);
        assert_eq!(score_to_count(f64::NAN), 0);
        assert_eq!(score_to_count(4.0), 4);
    }
}
