use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};

use crate::{
    application::repos::{RepoError, ViewsRepo},
    domain::entities::ViewCounter,
};

use super::{
    PostgresRepositories, map_sqlx_error,
    util::{count_from_db, count_to_db},
};

#[derive(sqlx::FromRow)]
struct ViewCountRow {
    post_id: String,
    view_count: i64,
}

#[async_trait]
impl ViewsRepo for PostgresRepositories {
    async fn write_view_counts(&self, counts: &[ViewCounter]) -> Result<(), RepoError> {
        if counts.is_empty() {
            return Ok(());
        }

        let rows = counts
            .iter()
            .map(|counter| {
                count_to_db(counter.count, "post_view_counts.view_count")
                    .map(|count| (counter.post_id.as_str(), count))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO post_view_counts (post_id, view_count, updated_at) ",
        );
        qb.push_values(rows, |mut row, (post_id, count)| {
            row.push_bind(post_id).push_bind(count).push("now()");
        });
        qb.push(
            " ON CONFLICT (post_id) DO UPDATE \
             SET view_count = EXCLUDED.view_count, updated_at = EXCLUDED.updated_at",
        );
        qb.build()
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn read_view_counts(
        &self,
        post_ids: &[String],
    ) -> Result<HashMap<String, u64>, RepoError> {
        if post_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, ViewCountRow>(
            r#"
            SELECT post_id, view_count
            FROM post_view_counts
            WHERE post_id = ANY($1)
            "#,
        )
        .bind(post_ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                count_from_db(row.view_count, "post_view_counts.view_count")
                    .map(|count| (row.post_id, count))
            })
            .collect()
    }
}
