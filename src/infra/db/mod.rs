//! Postgres repositories backing the engagement caches.
//!
//! Each submodule implements one repository trait from
//! [`crate::application::repos`] over the tables in `migrations/`.

mod followers;
mod tags;
mod trending;
mod util;
mod views;

pub use util::map_sqlx_error;

use std::{sync::Arc, time::Duration};

use sqlx::{
    Postgres, Transaction,
    postgres::{PgPool, PgPoolOptions},
    query_scalar,
};
use tracing::info;

use crate::config::DatabaseSettings;

use super::error::InfraError;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool from settings and bring the schema up to date.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, InfraError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| InfraError::missing_setting("database.url"))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.get())
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|err| InfraError::postgres("connect", err))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| InfraError::postgres("migrate", err.into()))?;

        info!(
            max_connections = settings.max_connections.get(),
            "postgres pool ready"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn health_check(&self) -> Result<(), InfraError> {
        query_scalar::<_, i32>("SELECT 1")
            .fetch_one(self.pool())
            .await
            .map(|_| ())
            .map_err(|err| InfraError::postgres("health check", err))
    }
}
