//! Refresh-ahead cache for trending hashtags.
//!
//! The list is recomputed by a [`TrendingSource`] and stored three ways: the
//! primary snapshot (short TTL), a [`BackupRecord`] copy (long TTL) and the
//! `last_updated` timestamp. Age relative to the primary TTL decides the
//! [`Freshness`]: readers keep being served while a refresh runs in the
//! background, and fall back to the backup once the primary is gone.
//!
//! Refreshes take the `trending:refreshing` claim first, so concurrent
//! readers and the cron worker never recompute the list at the same time.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    clock::Clock,
    codec::{self, BackupRecord, TrendingSnapshot, decode_timestamp, encode_timestamp},
    config::CacheConfig,
    keys::CacheKey,
    kv::{KvError, KvExt, KvStore, Pipeline, report_kv_error},
};
use crate::{application::repos::TrendingSource, domain::entities::TrendingTopic};

pub(crate) const METRIC_TRENDING_REFRESH_TOTAL: &str = "feedtally_trending_refresh_total";

/// Upper bound on how long a crashed refresher can block the next one.
const REFRESH_CLAIM_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than half the TTL.
    Fresh,
    /// Between half the TTL and the TTL: served, refresh due.
    Stale,
    /// At least one TTL old, or never computed.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    /// The list was fresh enough; nothing was recomputed.
    Skipped,
    /// A new list with this many topics was stored.
    Refreshed(usize),
    /// The source or the store failed; the previous list stays in place.
    Failed,
}

impl WarmOutcome {
    fn label(self) -> &'static str {
        match self {
            WarmOutcome::Skipped => "skipped",
            WarmOutcome::Refreshed(_) => "refreshed",
            WarmOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct TrendingCache {
    kv: Arc<dyn KvStore>,
    source: Arc<dyn TrendingSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    backup_ttl: Duration,
    window: Duration,
    limit: usize,
}

impl TrendingCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        source: Arc<dyn TrendingSource>,
        clock: Arc<dyn Clock>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            kv,
            source,
            clock,
            ttl: config.trending_ttl,
            backup_ttl: config.trending_backup_ttl,
            window: config.trending_window,
            limit: config.trending_limit,
        }
    }

    /// Current list: the primary snapshot, else the backup, else empty.
    pub async fn get(&self) -> Vec<TrendingTopic> {
        let primary = CacheKey::trending_topics();
        match self.kv.get(primary.as_str()).await {
            Ok(Some(bytes)) => match codec::decode::<TrendingSnapshot>(&bytes) {
                Ok(snapshot) => return snapshot.topics,
                Err(err) => warn!(
                    key = primary.as_str(),
                    error = %err,
                    "discarding undecodable trending snapshot"
                ),
            },
            Ok(None) => {}
            Err(err) => {
                report_kv_error("trending.get", primary.as_str(), &err);
                return Vec::new();
            }
        }

        let backup = CacheKey::trending_topics_backup();
        match self.kv.get(backup.as_str()).await {
            Ok(Some(bytes)) => match codec::decode::<BackupRecord<TrendingSnapshot>>(&bytes) {
                Ok(record) => {
                    debug!(
                        snapshot_at = %record.timestamp,
                        "serving trending topics from backup"
                    );
                    record.data.topics
                }
                Err(err) => {
                    warn!(
                        key = backup.as_str(),
                        error = %err,
                        "discarding undecodable trending backup"
                    );
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                report_kv_error("trending.get_backup", backup.as_str(), &err);
                Vec::new()
            }
        }
    }

    /// Serve the current list and, unless it is fresh, start a background
    /// refresh. No task is spawned while another refresh holds the claim.
    /// The handle may be dropped; the refresh keeps running.
    pub async fn get_or_refresh(&self) -> (Vec<TrendingTopic>, Option<JoinHandle<WarmOutcome>>) {
        let topics = self.get().await;
        if self.freshness().await == Freshness::Fresh {
            return (topics, None);
        }

        match self.claim_refresh().await {
            Ok(true) => {}
            Ok(false) => return (topics, None),
            Err(err) => {
                report_kv_error(
                    "trending.claim_refresh",
                    CacheKey::trending_refreshing().as_str(),
                    &err,
                );
                return (topics, None);
            }
        }

        let cache = self.clone();
        let handle = tokio::spawn(async move { cache.warm_claimed().await });
        (topics, Some(handle))
    }

    /// Store a freshly computed list with its backup and timestamp.
    pub async fn set(&self, topics: &[TrendingTopic]) -> Result<(), KvError> {
        let now = self.clock.now();
        let snapshot = TrendingSnapshot {
            topics: topics.to_vec(),
        };
        let backup = BackupRecord {
            data: snapshot.clone(),
            timestamp: now,
        };

        let (primary_bytes, backup_bytes) = match (codec::encode(&snapshot), codec::encode(&backup))
        {
            (Ok(primary), Ok(backup)) => (primary, backup),
            (Err(err), _) | (_, Err(err)) => {
                return Err(KvError::command(format!(
                    "failed to encode trending snapshot: {err}"
                )));
            }
        };

        let mut pipeline = Pipeline::atomic();
        pipeline.set_with_ttl(CacheKey::trending_topics(), primary_bytes, self.ttl);
        pipeline.set_with_ttl(
            CacheKey::trending_topics_backup(),
            backup_bytes,
            self.backup_ttl,
        );
        pipeline.set_with_ttl(
            CacheKey::trending_last_updated(),
            encode_timestamp(now),
            self.backup_ttl,
        );
        self.kv.execute(pipeline).await.map(|_| ())
    }

    /// Age of the stored list relative to the primary TTL.
    pub async fn freshness(&self) -> Freshness {
        let Some(age) = self.age().await else {
            return Freshness::Expired;
        };
        if age < self.ttl / 2 {
            Freshness::Fresh
        } else if age < self.ttl {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// True when the list is older than half its TTL or was never computed.
    pub async fn should_refresh(&self) -> bool {
        match self.age().await {
            Some(age) => age > self.ttl / 2,
            None => true,
        }
    }

    /// Recompute and store the list if it is due. Skipped while another
    /// refresh holds the claim.
    pub async fn warm_cache(&self) -> WarmOutcome {
        match self.claim_refresh().await {
            Ok(true) => self.warm_claimed().await,
            Ok(false) => {
                debug!("trending refresh already in progress");
                record(WarmOutcome::Skipped)
            }
            Err(err) => {
                // The refresh below reports the store failure itself.
                debug!(error = %err, "could not claim trending refresh");
                record(self.warm_inner().await)
            }
        }
    }

    async fn warm_claimed(&self) -> WarmOutcome {
        let outcome = self.warm_inner().await;
        let claim = CacheKey::trending_refreshing();
        if let Err(err) = self.kv.del(vec![claim.to_string()]).await {
            report_kv_error("trending.release_refresh", claim.as_str(), &err);
        }
        record(outcome)
    }

    async fn claim_refresh(&self) -> Result<bool, KvError> {
        self.kv
            .set_nx_with_ttl(
                CacheKey::trending_refreshing().as_str(),
                Bytes::from_static(b"1"),
                REFRESH_CLAIM_TTL,
            )
            .await
    }

    async fn warm_inner(&self) -> WarmOutcome {
        if !self.should_refresh().await {
            return WarmOutcome::Skipped;
        }

        let since = self.clock.now() - self.window;
        let topics = match self.source.trending_topics(since, self.limit).await {
            Ok(topics) => topics,
            Err(err) => {
                warn!(error = %err, "trending source failed, keeping previous list");
                return WarmOutcome::Failed;
            }
        };

        match self.set(&topics).await {
            Ok(()) => {
                info!(topics = topics.len(), "refreshed trending topics");
                WarmOutcome::Refreshed(topics.len())
            }
            Err(err) => {
                report_kv_error("trending.set", CacheKey::trending_topics().as_str(), &err);
                WarmOutcome::Failed
            }
        }
    }

    async fn age(&self) -> Option<Duration> {
        let key = CacheKey::trending_last_updated();
        let bytes = match self.kv.get(key.as_str()).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                report_kv_error("trending.last_updated", key.as_str(), &err);
                return None;
            }
        };
        let updated_at = decode_timestamp(&bytes)?;
        // A timestamp from the future counts as brand new.
        Some(Duration::try_from(self.clock.now() - updated_at).unwrap_or(Duration::ZERO))
    }
}

fn record(outcome: WarmOutcome) -> WarmOutcome {
    counter!(METRIC_TRENDING_REFRESH_TOTAL, "outcome" => outcome.label()).increment(1);
    outcome
}
