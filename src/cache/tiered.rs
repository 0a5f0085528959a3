//! Primary + backup lookup cache.
//!
//! Every value is written twice: a short-lived primary copy and a long-lived
//! [`BackupRecord`]. Reads prefer the primary; a backup hit re-seeds the
//! primary so the next read is a primary hit again. What a "value" is and
//! which keys it touches is described by a [`Projection`].

use std::{sync::Arc, time::Duration};

use metrics::counter;
use tracing::{debug, warn};

use super::{
    clock::Clock,
    codec::{self, BackupRecord, Versioned},
    config::backup_ttl_is_sufficient,
    keys::CacheKey,
    kv::{KvExt, KvStore, Pipeline, report_kv_error},
};

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "feedtally_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "feedtally_cache_miss_total";

/// Key layout and secondary-index behaviour of one tiered cache.
pub trait Projection: Send + Sync {
    type Id: Send + Sync;
    type Value: Versioned + Clone + Send + Sync;

    /// Label used in logs and metrics.
    const NAME: &'static str;

    fn primary_key(&self, id: &Self::Id) -> CacheKey;

    fn backup_key(&self, id: &Self::Id) -> CacheKey;

    /// Derived writes queued in the same atomic pipeline as `set`.
    fn index_updates(&self, _id: &Self::Id, _value: &Self::Value, _pipeline: &mut Pipeline) {}

    /// Extra keys and index entries dropped together with `id`.
    fn invalidation_fanout(&self, _id: &Self::Id, _pipeline: &mut Pipeline) {}
}

/// Which copy answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Backup,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Backup => "backup",
        }
    }
}

pub struct TieredCache<P: Projection> {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    projection: P,
    primary_ttl: Duration,
    backup_ttl: Duration,
}

impl<P: Projection> TieredCache<P> {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        projection: P,
        primary_ttl: Duration,
        backup_ttl: Duration,
    ) -> Self {
        if !backup_ttl_is_sufficient(primary_ttl, backup_ttl) {
            warn!(
                cache = P::NAME,
                primary_ttl_secs = primary_ttl.as_secs(),
                backup_ttl_secs = backup_ttl.as_secs(),
                "backup ttl is shorter than four primary ttls"
            );
        }
        Self {
            kv,
            clock,
            projection,
            primary_ttl,
            backup_ttl,
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Cached value for `id`, falling back to the backup copy.
    pub async fn get(&self, id: &P::Id) -> Option<P::Value> {
        self.get_with_tier(id).await.map(|(value, _)| value)
    }

    /// Like [`TieredCache::get`], also reporting which copy answered.
    pub async fn get_with_tier(&self, id: &P::Id) -> Option<(P::Value, Tier)> {
        let primary_key = self.projection.primary_key(id);
        let primary = match self.kv.get(primary_key.as_str()).await {
            Ok(bytes) => bytes,
            Err(err) => {
                report_kv_error("tiered.get_primary", primary_key.as_str(), &err);
                return None;
            }
        };

        if let Some(bytes) = primary {
            match codec::decode::<P::Value>(&bytes) {
                Ok(value) => {
                    record_hit(P::NAME, Tier::Primary);
                    return Some((value, Tier::Primary));
                }
                Err(err) => {
                    warn!(
                        cache = P::NAME,
                        key = primary_key.as_str(),
                        error = %err,
                        "discarding undecodable primary entry"
                    );
                }
            }
        }

        let backup_key = self.projection.backup_key(id);
        let backup = match self.kv.get(backup_key.as_str()).await {
            Ok(bytes) => bytes,
            Err(err) => {
                report_kv_error("tiered.get_backup", backup_key.as_str(), &err);
                return None;
            }
        };

        let Some(bytes) = backup else {
            counter!(METRIC_CACHE_MISS_TOTAL, "cache" => P::NAME).increment(1);
            return None;
        };

        let record = match codec::decode::<BackupRecord<P::Value>>(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    cache = P::NAME,
                    key = backup_key.as_str(),
                    error = %err,
                    "discarding undecodable backup entry"
                );
                counter!(METRIC_CACHE_MISS_TOTAL, "cache" => P::NAME).increment(1);
                return None;
            }
        };

        record_hit(P::NAME, Tier::Backup);
        self.repopulate_primary(&primary_key, &record.data).await;
        Some((record.data, Tier::Backup))
    }

    /// Write primary, backup and derived index entries as one unit.
    pub async fn set(&self, id: &P::Id, value: &P::Value) {
        let primary_key = self.projection.primary_key(id);
        let backup = BackupRecord {
            data: value.clone(),
            timestamp: self.clock.now(),
        };

        let (primary_bytes, backup_bytes) = match (codec::encode(value), codec::encode(&backup)) {
            (Ok(primary), Ok(backup)) => (primary, backup),
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    cache = P::NAME,
                    key = primary_key.as_str(),
                    error = %err,
                    "failed to encode cache entry"
                );
                return;
            }
        };

        let mut pipeline = Pipeline::atomic();
        pipeline.set_with_ttl(&primary_key, primary_bytes, self.primary_ttl);
        pipeline.set_with_ttl(self.projection.backup_key(id), backup_bytes, self.backup_ttl);
        self.projection.index_updates(id, value, &mut pipeline);

        if let Err(err) = self.kv.execute(pipeline).await {
            report_kv_error("tiered.set", primary_key.as_str(), &err);
        }
    }

    /// Drop both copies of `id` and everything its projection fans out to.
    pub async fn invalidate(&self, id: &P::Id) {
        let primary_key = self.projection.primary_key(id);
        let mut pipeline = Pipeline::atomic();
        pipeline.del([&primary_key, &self.projection.backup_key(id)]);
        self.projection.invalidation_fanout(id, &mut pipeline);

        match self.kv.execute(pipeline).await {
            Ok(_) => debug!(
                cache = P::NAME,
                key = primary_key.as_str(),
                "invalidated tiered entry"
            ),
            Err(err) => report_kv_error("tiered.invalidate", primary_key.as_str(), &err),
        }
    }

    async fn repopulate_primary(&self, primary_key: &CacheKey, value: &P::Value) {
        let bytes = match codec::encode(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(cache = P::NAME, error = %err, "failed to encode primary entry");
                return;
            }
        };
        if let Err(err) = self
            .kv
            .set_with_ttl(primary_key.as_str(), bytes, self.primary_ttl)
            .await
        {
            report_kv_error("tiered.repopulate", primary_key.as_str(), &err);
        }
    }
}

fn record_hit(cache: &'static str, tier: Tier) {
    counter!(METRIC_CACHE_HIT_TOTAL, "cache" => cache, "tier" => tier.as_str()).increment(1);
}
