//! Follower relationship projection on top of [`TieredCache`].

use std::sync::Arc;

use super::{
    clock::Clock,
    config::CacheConfig,
    keys::CacheKey,
    kv::{KvExt, KvStore, Pipeline, report_kv_error},
    tiered::{Projection, Tier, TieredCache},
};
use crate::domain::entities::FollowerInfo;

/// A user's follower projection as seen by one viewer (or anonymously).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FollowerKey {
    pub user_id: String,
    pub viewer_id: Option<String>,
}

impl FollowerKey {
    pub fn new(user_id: &str, viewer_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            viewer_id: viewer_id.map(str::to_string),
        }
    }

    pub fn anonymous(user_id: &str) -> Self {
        Self::new(user_id, None)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FollowerProjection;

impl Projection for FollowerProjection {
    type Id = FollowerKey;
    type Value = FollowerInfo;

    const NAME: &'static str = "follower_info";

    fn primary_key(&self, id: &FollowerKey) -> CacheKey {
        CacheKey::follower_info(&id.user_id, id.viewer_id.as_deref())
    }

    fn backup_key(&self, id: &FollowerKey) -> CacheKey {
        CacheKey::follower_info_backup(&id.user_id, id.viewer_id.as_deref())
    }

    fn index_updates(&self, id: &FollowerKey, value: &FollowerInfo, pipeline: &mut Pipeline) {
        let Some(viewer) = id.viewer_id.as_deref() else {
            return;
        };
        let set = CacheKey::followers_of(&id.user_id);
        if value.is_followed_by_user {
            pipeline.set_add(set, viewer);
        } else {
            pipeline.set_remove(set, viewer);
        }
    }

    /// A follow or unfollow by a named viewer also changes the follower count
    /// every other viewer sees; the anonymous projection is dropped with it.
    fn invalidation_fanout(&self, id: &FollowerKey, pipeline: &mut Pipeline) {
        let Some(viewer) = id.viewer_id.as_deref() else {
            return;
        };
        pipeline.del([
            CacheKey::follower_info(&id.user_id, None),
            CacheKey::follower_info_backup(&id.user_id, None),
        ]);
        pipeline.set_remove(CacheKey::followers_of(&id.user_id), viewer);
    }
}

pub struct FollowerCache {
    tiered: TieredCache<FollowerProjection>,
}

impl FollowerCache {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self {
            tiered: TieredCache::new(
                kv,
                clock,
                FollowerProjection,
                config.follower_ttl,
                config.follower_backup_ttl,
            ),
        }
    }

    pub async fn get(&self, user_id: &str, viewer_id: Option<&str>) -> Option<FollowerInfo> {
        self.tiered.get(&FollowerKey::new(user_id, viewer_id)).await
    }

    pub async fn get_with_tier(
        &self,
        user_id: &str,
        viewer_id: Option<&str>,
    ) -> Option<(FollowerInfo, Tier)> {
        self.tiered
            .get_with_tier(&FollowerKey::new(user_id, viewer_id))
            .await
    }

    pub async fn set(&self, user_id: &str, viewer_id: Option<&str>, info: &FollowerInfo) {
        self.tiered
            .set(&FollowerKey::new(user_id, viewer_id), info)
            .await;
    }

    pub async fn invalidate(&self, user_id: &str, viewer_id: Option<&str>) {
        self.tiered
            .invalidate(&FollowerKey::new(user_id, viewer_id))
            .await;
    }

    /// Whether `viewer_id` is recorded as a follower in the derived set.
    /// Absence means "not known to follow", not "known not to follow".
    pub async fn is_follower(&self, user_id: &str, viewer_id: &str) -> bool {
        let key = CacheKey::followers_of(user_id);
        match self.tiered.kv().set_is_member(key.as_str(), viewer_id).await {
            Ok(member) => member,
            Err(err) => {
                report_kv_error("followers.is_follower", key.as_str(), &err);
                false
            }
        }
    }
}
