//! Ordered, fail-fast migration of every registered data store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::Instrument;

use crate::config::ResolvedConfiguration;
use crate::http::Host;

/// Error type returned by stores and seeders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for a migration run.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migrating {target} failed: {source}")]
    Migrate {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("seeding {target} failed: {source}")]
    Seed {
        target: String,
        #[source]
        source: BoxError,
    },
}

impl MigrationError {
    /// Name of the target that failed.
    pub fn target(&self) -> &str {
        match self {
            Self::Migrate { target, .. } | Self::Seed { target, .. } => target,
        }
    }
}

/// Services visible to one target's migration and seed.
///
/// Created fresh for every target; nothing is carried from one target to
/// the next.
#[derive(Debug, Clone)]
pub struct ServiceScope {
    target: String,
    config: Arc<ResolvedConfiguration>,
    content_root: PathBuf,
    web_root: PathBuf,
}

impl ServiceScope {
    /// Scope for `target` over the host's configuration and paths.
    pub fn for_target(host: &Host, target: &str) -> Self {
        Self {
            target: target.to_string(),
            config: Arc::clone(host.configuration()),
            content_root: host.content_root().to_path_buf(),
            web_root: host.web_root().to_path_buf(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn configuration(&self) -> &ResolvedConfiguration {
        &self.config
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }
}

/// A data store with pending schema migrations.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Apply every pending migration.
    async fn migrate(&self, scope: &ServiceScope) -> Result<(), BoxError>;
}

/// One-time data seeding run after a store is migrated.
#[async_trait]
pub trait Seeder: Send + Sync {
    async fn seed(&self, scope: &ServiceScope) -> Result<(), BoxError>;
}

/// A store plus its optional seed step.
#[derive(Clone)]
pub struct MigrationTarget {
    name: String,
    store: Arc<dyn DataStore>,
    seeder: Option<Arc<dyn Seeder>>,
}

impl MigrationTarget {
    pub fn new(name: impl Into<String>, store: Arc<dyn DataStore>) -> Self {
        Self {
            name: name.into(),
            store,
            seeder: None,
        }
    }

    pub fn with_seeder(mut self, seeder: Arc<dyn Seeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for MigrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationTarget")
            .field("name", &self.name)
            .field("seeded", &self.seeder.is_some())
            .finish()
    }
}

/// Migrate and seed each target in order, stopping at the first failure.
pub async fn apply_migrations(host: &Host, targets: &[MigrationTarget]) -> Result<(), MigrationError> {
    for target in targets {
        let scope = ServiceScope::for_target(host, target.name());
        let span = tracing::info_span!("migration", migration_target = %target.name());

        async {
            tracing::info!("Migrating database associated with {}", target.name());
            target
                .store
                .migrate(&scope)
                .await
                .map_err(|source| MigrationError::Migrate {
                    target: target.name().to_string(),
                    source,
                })?;

            if let Some(seeder) = &target.seeder {
                seeder.seed(&scope).await.map_err(|source| MigrationError::Seed {
                    target: target.name().to_string(),
                    source,
                })?;
            }
            tracing::info!("Migrated database associated with {}", target.name());
            Ok(())
        }
        .instrument(span)
        .await?;
    }
    Ok(())
}
