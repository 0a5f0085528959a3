use async_trait::async_trait;

use crate::{
    application::repos::{FollowersRepo, RepoError},
    domain::entities::FollowerInfo,
};

use super::{PostgresRepositories, map_sqlx_error, util::count_from_db};

#[derive(sqlx::FromRow)]
struct FollowerRow {
    followers: i64,
    is_followed_by_user: bool,
}

#[async_trait]
impl FollowersRepo for PostgresRepositories {
    async fn follower_info(
        &self,
        user_id: &str,
        viewer_id: Option<&str>,
    ) -> Result<FollowerInfo, RepoError> {
        let row = sqlx::query_as::<_, FollowerRow>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM follows WHERE followee_id = $1) AS followers,
                EXISTS (
                    SELECT 1 FROM follows
                    WHERE followee_id = $1 AND follower_id = $2
                ) AS is_followed_by_user
            "#,
        )
        .bind(user_id)
        .bind(viewer_id)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(FollowerInfo {
            followers: count_from_db(row.followers, "followers")?,
            is_followed_by_user: viewer_id.is_some() && row.is_followed_by_user,
        })
    }
}
