//! Flush dirty view counters from the cache into the durable store.
//!
//! Each run reads the dirty set, fetches the cached counters in chunks and
//! writes them as absolute values, one durable transaction per batch. Every
//! batch is read back: ids whose persisted value matches leave the dirty set
//! unless they were viewed again meanwhile, mismatches stay for the next run. Ids whose counter already expired are
//! skipped and dropped from the dirty set rather than written as zero.

use std::{collections::HashMap, sync::Arc, time::Instant};

use apalis::prelude::*;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    application::repos::{RepoError, ViewsRepo},
    cache::{CounterAggregator, KvError, kv::report_kv_error},
    domain::entities::ViewCounter,
};

use super::{JobWorkerContext, job_failed};

pub(crate) const METRIC_RECONCILE_FLUSHED_TOTAL: &str = "feedtally_reconcile_flushed_total";
pub(crate) const METRIC_RECONCILE_MISMATCH_TOTAL: &str = "feedtally_reconcile_mismatch_total";
pub(crate) const METRIC_RECONCILE_SKIPPED_TOTAL: &str = "feedtally_reconcile_skipped_total";
pub(crate) const METRIC_RECONCILE_MS: &str = "feedtally_reconcile_ms";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read the dirty set")]
    DirtySet(#[source] KvError),
    #[error("failed to read cached counters for batch {batch}")]
    Counters {
        batch: usize,
        #[source]
        source: KvError,
    },
    #[error("durable write failed for batch {batch}")]
    Write {
        batch: usize,
        #[source]
        source: RepoError,
    },
    #[error("verification read failed for batch {batch}")]
    Verify {
        batch: usize,
        #[source]
        source: RepoError,
    },
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    /// Ids found in the dirty set at the start of the run.
    pub dirty: usize,
    /// Counters written and verified.
    pub flushed: usize,
    /// Ids without a cached counter.
    pub skipped: usize,
    /// Counters whose persisted value differed after the write.
    pub mismatched: usize,
    pub batches: usize,
}

impl ReconcileReport {
    fn empty(run_id: Uuid) -> Self {
        Self {
            run_id,
            dirty: 0,
            flushed: 0,
            skipped: 0,
            mismatched: 0,
            batches: 0,
        }
    }
}

pub struct ReconcileJob {
    counters: Arc<CounterAggregator>,
    views: Arc<dyn ViewsRepo>,
    batch_size: usize,
}

impl ReconcileJob {
    pub fn new(
        counters: Arc<CounterAggregator>,
        views: Arc<dyn ViewsRepo>,
        batch_size: usize,
    ) -> Self {
        Self {
            counters,
            views,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let started = Instant::now();
        let result = self.run_inner(Uuid::new_v4()).await;
        histogram!(METRIC_RECONCILE_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<ReconcileReport, ReconcileError> {
        let mut dirty = self
            .counters
            .dirty_post_ids()
            .await
            .map_err(ReconcileError::DirtySet)?;
        dirty.sort();

        let mut report = ReconcileReport::empty(run_id);
        report.dirty = dirty.len();
        if dirty.is_empty() {
            info!(%run_id, "no dirty view counters");
            return Ok(report);
        }

        info!(
            %run_id,
            dirty = dirty.len(),
            batch_size = self.batch_size,
            "reconciling view counters"
        );

        for (batch, post_ids) in dirty.chunks(self.batch_size).enumerate() {
            let outcome = self.reconcile_batch(batch, post_ids).await?;
            report.batches += 1;
            report.flushed += outcome.flushed;
            report.skipped += outcome.skipped;
            report.mismatched += outcome.mismatched;

            info!(
                %run_id,
                batch,
                flushed = outcome.flushed,
                skipped = outcome.skipped,
                mismatched = outcome.mismatched,
                "reconciled batch"
            );
        }

        info!(
            %run_id,
            dirty = report.dirty,
            flushed = report.flushed,
            skipped = report.skipped,
            mismatched = report.mismatched,
            batches = report.batches,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_batch(
        &self,
        batch: usize,
        post_ids: &[String],
    ) -> Result<BatchOutcome, ReconcileError> {
        let cached = self
            .counters
            .cached_views(post_ids)
            .await
            .map_err(|source| ReconcileError::Counters { batch, source })?;

        let mut writes = Vec::with_capacity(post_ids.len());
        let mut missing = Vec::new();
        for post_id in post_ids {
            match cached.get(post_id).copied().flatten() {
                Some(count) => writes.push(ViewCounter {
                    post_id: post_id.clone(),
                    count,
                }),
                None => missing.push(post_id.clone()),
            }
        }

        let mut outcome = BatchOutcome {
            skipped: missing.len(),
            ..BatchOutcome::default()
        };

        if !missing.is_empty() {
            for post_id in &missing {
                warn!(
                    batch,
                    post_id = post_id.as_str(),
                    "cached view counter expired before reconciliation, skipping"
                );
            }
            counter!(METRIC_RECONCILE_SKIPPED_TOTAL).increment(missing.len() as u64);
            let seen: Vec<_> = missing.iter().map(|id| (id.clone(), None)).collect();
            self.clear(batch, &seen).await;
        }

        if writes.is_empty() {
            return Ok(outcome);
        }

        self.views
            .write_view_counts(&writes)
            .await
            .map_err(|source| ReconcileError::Write { batch, source })?;

        let written: Vec<String> = writes.iter().map(|w| w.post_id.clone()).collect();
        let persisted = self
            .views
            .read_view_counts(&written)
            .await
            .map_err(|source| ReconcileError::Verify { batch, source })?;

        let (verified, mismatched) = verify(&writes, &persisted);
        for counter in &mismatched {
            warn!(
                batch,
                post_id = counter.post_id.as_str(),
                expected = counter.count,
                persisted = ?persisted.get(&counter.post_id),
                "persisted view count does not match, leaving post dirty"
            );
        }

        outcome.flushed = verified.len();
        outcome.mismatched = mismatched.len();
        counter!(METRIC_RECONCILE_FLUSHED_TOTAL).increment(verified.len() as u64);
        if !mismatched.is_empty() {
            counter!(METRIC_RECONCILE_MISMATCH_TOTAL).increment(mismatched.len() as u64);
        }

        let seen: Vec<_> = writes
            .iter()
            .filter(|w| verified.contains(&w.post_id))
            .map(|w| (w.post_id.clone(), Some(w.count)))
            .collect();
        self.clear(batch, &seen).await;
        Ok(outcome)
    }

    /// Remove reconciled ids from the dirty set. Ids viewed again since
    /// their counter was read stay dirty; a failure only means they are
    /// reconciled again next run.
    async fn clear(&self, batch: usize, seen: &[(String, Option<u64>)]) {
        match self.counters.clear_dirty_unless_changed(seen).await {
            Ok(changed) => {
                for post_id in &changed {
                    info!(
                        batch,
                        post_id = post_id.as_str(),
                        "view counter changed during reconciliation, keeping post dirty"
                    );
                }
            }
            Err(err) => report_kv_error("reconcile.clear_dirty", "views_dirty", &err),
        }
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    flushed: usize,
    skipped: usize,
    mismatched: usize,
}

fn verify<'a>(
    writes: &'a [ViewCounter],
    persisted: &HashMap<String, u64>,
) -> (Vec<String>, Vec<&'a ViewCounter>) {
    let mut verified = Vec::with_capacity(writes.len());
    let mut mismatched = Vec::new();
    for counter in writes {
        if persisted.get(&counter.post_id) == Some(&counter.count) {
            verified.push(counter.post_id.clone());
        } else {
            mismatched.push(counter);
        }
    }
    (verified, mismatched)
}

/// Marker for one scheduled reconciliation run.
/// apalis-cron builds it from the tick time.
#[derive(Default, Debug, Clone)]
pub struct ReconcileTick;

impl From<chrono::DateTime<chrono::Utc>> for ReconcileTick {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

pub async fn process_reconcile_job(
    _job: ReconcileTick,
    ctx: Data<JobWorkerContext>,
) -> Result<(), apalis::prelude::Error> {
    ctx.reconcile.run().await.map(|_| ()).map_err(job_failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(post_id: &str, count: u64) -> ViewCounter {
        ViewCounter {
            post_id: post_id.to_string(),
            count,
        }
    }

    #[test]
    fn verify_splits_matches_from_mismatches() {
        let writes = vec![counter("a", 3), counter("b", 4), counter("c", 5)];
        let persisted = HashMap::from([("a".to_string(), 3), ("b".to_string(), 1)]);

        let (verified, mismatched) = verify(&writes, &persisted);

        assert_eq!(verified, vec!["a".to_string()]);
        let ids: Vec<&str> = mismatched.iter().map(|c| c.post_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn batch_size_is_at_least_one() {
        use crate::{
            cache::CacheConfig,
            infra::memory::{InMemoryRepositories, MemoryKv},
        };

        let kv = Arc::new(MemoryKv::new());
        let counters = Arc::new(CounterAggregator::new(kv, &CacheConfig::default()));
        let job = ReconcileJob::new(counters, Arc::new(InMemoryRepositories::new()), 0);
        assert_eq!(job.batch_size(), 1);
    }
}
