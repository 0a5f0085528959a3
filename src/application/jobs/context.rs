use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::cache::{PopularityTracker, TrendingCache};

use super::ReconcileJob;

/// Shared context passed to the cron workers.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub reconcile: Arc<ReconcileJob>,
    pub trending: TrendingCache,
    pub popularity: Arc<PopularityTracker>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}
