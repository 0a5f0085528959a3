//! Read-through access to follower projections.

use std::sync::Arc;

use tracing::debug;

use crate::{
    application::repos::{FollowersRepo, RepoError},
    cache::FollowerCache,
    domain::entities::FollowerInfo,
};

pub struct FollowerService {
    cache: FollowerCache,
    repo: Arc<dyn FollowersRepo>,
}

impl FollowerService {
    pub fn new(cache: FollowerCache, repo: Arc<dyn FollowersRepo>) -> Self {
        Self { cache, repo }
    }

    /// Cached projection of `user_id` for `viewer_id`, loaded from the durable
    /// store and cached on a miss.
    pub async fn follower_info(
        &self,
        user_id: &str,
        viewer_id: Option<&str>,
    ) -> Result<FollowerInfo, RepoError> {
        if let Some(info) = self.cache.get(user_id, viewer_id).await {
            return Ok(info);
        }

        let info = self.repo.follower_info(user_id, viewer_id).await?;
        debug!(
            user_id,
            viewer_id = viewer_id.unwrap_or("anon"),
            followers = info.followers,
            "loaded follower info from durable store"
        );
        self.cache.set(user_id, viewer_id, &info).await;
        Ok(info)
    }

    /// Drop every projection a follow or unfollow of `user_id` by `viewer_id`
    /// made stale. The durable write happens elsewhere, before this call.
    pub async fn relationship_changed(&self, user_id: &str, viewer_id: &str) {
        self.cache.invalidate(user_id, Some(viewer_id)).await;
    }

    /// Whether `viewer_id` follows `user_id`, answered from the projection.
    pub async fn is_following(&self, user_id: &str, viewer_id: &str) -> Result<bool, RepoError> {
        if self.cache.is_follower(user_id, viewer_id).await {
            return Ok(true);
        }
        self.follower_info(user_id, Some(viewer_id))
            .await
            .map(|info| info.is_followed_by_user)
    }

    pub fn cache(&self) -> &FollowerCache {
        &self.cache
    }
}
