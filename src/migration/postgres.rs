//! PostgreSQL data store backed by sqlx migrations.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::OnceCell;

use crate::config::schema::CONNECTION_STRING;
use crate::migration::runner::{BoxError, DataStore, Seeder, ServiceScope};

const MAX_POOL_CONNECTIONS: u32 = 5;

/// Runs the migrations found in a directory under the content root.
pub struct PostgresStore {
    connection_key: String,
    migrations_dir: PathBuf,
    pool: OnceCell<PgPool>,
}

impl PostgresStore {
    /// Store connected through `ConnectionString`.
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self::with_connection_key(CONNECTION_STRING, migrations_dir)
    }

    pub fn with_connection_key(key: impl Into<String>, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            connection_key: key.into(),
            migrations_dir: migrations_dir.into(),
            pool: OnceCell::new(),
        }
    }

    /// Pool for this store, connected on first use.
    pub async fn pool(&self, scope: &ServiceScope) -> Result<&PgPool, BoxError> {
        self.pool
            .get_or_try_init(|| async move {
                let url = scope
                    .configuration()
                    .get_non_blank(&self.connection_key)
                    .ok_or_else(|| format!("{} is not configured", self.connection_key))?;
                let pool = PgPoolOptions::new()
                    .max_connections(MAX_POOL_CONNECTIONS)
                    .connect(url)
                    .await?;
                Ok::<_, BoxError>(pool)
            })
            .await
    }
}

#[async_trait]
impl DataStore for PostgresStore {
    async fn migrate(&self, scope: &ServiceScope) -> Result<(), BoxError> {
        let pool = self.pool(scope).await?;
        let dir = scope.content_root().join(&self.migrations_dir);
        let migrator = Migrator::new(dir).await?;
        tracing::debug!(migrations = migrator.iter().count(), "Applying pending migrations");
        migrator.run(pool).await?;
        Ok(())
    }
}

/// Executes a SQL script from the content root, if it exists.
pub struct SqlScriptSeeder {
    store: Arc<PostgresStore>,
    script: PathBuf,
}

impl SqlScriptSeeder {
    pub fn new(store: Arc<PostgresStore>, script: impl Into<PathBuf>) -> Self {
        Self {
            store,
            script: script.into(),
        }
    }
}

#[async_trait]
impl Seeder for SqlScriptSeeder {
    async fn seed(&self, scope: &ServiceScope) -> Result<(), BoxError> {
        let path = scope.content_root().join(&self.script);
        let sql = match tokio::fs::read_to_string(&path).await {
            Ok(sql) => sql,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(script = %path.display(), "No seed script, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let pool = self.store.pool(scope).await?;
        sqlx::raw_sql(&sql).execute(pool).await?;
        tracing::info!(script = %path.display(), "Seed script applied");
        Ok(())
    }
}
