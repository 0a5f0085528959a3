//! Cron job that re-mirrors the durable tag table into the cache.

use apalis::prelude::*;
use tracing::info;

use super::{JobWorkerContext, job_failed};

/// Marker for one scheduled tag sync.
/// apalis-cron builds it from the tick time.
#[derive(Default, Debug, Clone)]
pub struct TagSyncTick;

impl From<chrono::DateTime<chrono::Utc>> for TagSyncTick {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

pub async fn process_tag_sync_job(
    _job: TagSyncTick,
    ctx: Data<JobWorkerContext>,
) -> Result<(), apalis::prelude::Error> {
    let active = ctx.popularity.sync_from_durable().await.map_err(job_failed)?;
    info!(active, "scheduled tag sync finished");
    Ok(())
}
