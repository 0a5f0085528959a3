//! Cron job that keeps the trending list warm.

use apalis::prelude::*;

use super::JobWorkerContext;

/// Marker for one scheduled trending refresh check.
/// apalis-cron builds it from the tick time.
#[derive(Default, Debug, Clone)]
pub struct TrendingTick;

impl From<chrono::DateTime<chrono::Utc>> for TrendingTick {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

/// Refresh the trending list if it is due. Failures keep the previous list
/// and are already logged, so the tick itself never fails.
pub async fn process_trending_job(
    _job: TrendingTick,
    ctx: Data<JobWorkerContext>,
) -> Result<(), apalis::prelude::Error> {
    let outcome = ctx.trending.warm_cache().await;
    tracing::debug!(?outcome, "trending tick finished");
    Ok(())
}
