use async_trait::async_trait;

use crate::{
    application::repos::{RepoError, TagsRepo},
    domain::{entities::TagCount, values::TagName},
};

use super::{PostgresRepositories, map_sqlx_error, util::count_from_db};

#[derive(sqlx::FromRow)]
struct TagCountRow {
    name: String,
    count: i64,
}

#[async_trait]
impl TagsRepo for PostgresRepositories {
    async fn increment_tag(&self, name: &TagName) -> Result<u64, RepoError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tags (name, count, updated_at)
            VALUES ($1, 1, now())
            ON CONFLICT (name)
            DO UPDATE SET count = tags.count + 1, updated_at = now()
            RETURNING count
            "#,
        )
        .bind(name.as_str())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        count_from_db(count, "tags.count")
    }

    async fn decrement_tag(&self, name: &TagName) -> Result<u64, RepoError> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE tags
            SET count = GREATEST(count - 1, 0), updated_at = now()
            WHERE name = $1
            RETURNING count
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        count.map_or(Ok(0), |count| count_from_db(count, "tags.count"))
    }

    async fn delete_tag_if_unused(&self, name: &TagName) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tags t
            WHERE t.name = $1
              AND t.count = 0
              AND NOT EXISTS (SELECT 1 FROM post_tags pt WHERE pt.tag_name = t.name)
            "#,
        )
        .bind(name.as_str())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active_tags(&self) -> Result<Vec<TagCount>, RepoError> {
        let rows = sqlx::query_as::<_, TagCountRow>(
            r#"
            SELECT name, count
            FROM tags
            WHERE count > 0
            ORDER BY count DESC, name
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                Ok(TagCount {
                    count: count_from_db(row.count, "tags.count")?,
                    name: row.name,
                })
            })
            .collect()
    }

    async fn list_searchable_tag_names(&self) -> Result<Vec<String>, RepoError> {
        sqlx::query_scalar(
            r#"
            SELECT name FROM tags WHERE count > 0
            UNION
            SELECT tag_name FROM post_tags
            ORDER BY 1
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }
}
