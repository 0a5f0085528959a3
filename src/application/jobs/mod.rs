mod context;
mod reconcile;
mod tag_sync;
mod trending;

pub use context::{JobWorkerContext, job_failed};
pub use reconcile::{
    ReconcileError, ReconcileJob, ReconcileReport, ReconcileTick, process_reconcile_job,
};
pub use tag_sync::{TagSyncTick, process_tag_sync_job};
pub use trending::{TrendingTick, process_trending_job};

pub(crate) use reconcile::{
    METRIC_RECONCILE_FLUSHED_TOTAL, METRIC_RECONCILE_MISMATCH_TOTAL, METRIC_RECONCILE_MS,
    METRIC_RECONCILE_SKIPPED_TOTAL,
};
