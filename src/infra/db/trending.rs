use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    application::repos::{RepoError, TrendingSource},
    domain::entities::TrendingTopic,
};

use super::{PostgresRepositories, map_sqlx_error, util::count_from_db};

#[derive(sqlx::FromRow)]
struct TrendingRow {
    hashtag: String,
    uses: i64,
}

#[async_trait]
impl TrendingSource for PostgresRepositories {
    async fn trending_topics(
        &self,
        since: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<TrendingTopic>, RepoError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, TrendingRow>(
            r#"
            SELECT pt.tag_name AS hashtag, COUNT(*) AS uses
            FROM post_tags pt
            INNER JOIN posts p ON p.id = pt.post_id
            WHERE p.created_at >= $1
            GROUP BY pt.tag_name
            ORDER BY uses DESC, hashtag
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                Ok(TrendingTopic {
                    count: count_from_db(row.uses, "uses")?,
                    hashtag: row.hashtag,
                })
            })
            .collect()
    }
}
