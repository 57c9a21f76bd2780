//! Repository selection and construction.
//!
//! The server picks a backend once at startup, from `REPOSITORY_TYPE`, a
//! `repository.toml` file, or an explicit [`RepositoryBuilder`].

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::repo_config::RepositoryConfig;
use super::repositories::LocalRepository;
#[cfg(feature = "postgres-repo")]
use super::repositories::PostgresRepository;
use super::repository::{ReferenceRangeRepository, RepositoryError, RepositoryResult};
use super::schema_cache::{SchemaCache, SchemaInfo};
use super::PostgresConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryType {
    /// Postgres + Diesel implementation
    Postgres,
    /// In-memory local repository
    Local,
}

impl FromStr for RepositoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "local" | "memory" => Ok(Self::Local),
            _ => Err(format!("Unknown repository type: {}", s)),
        }
    }
}

impl RepositoryType {
    /// Reads `REPOSITORY_TYPE`. Without it, a configured database URL selects
    /// Postgres and anything else falls back to the in-memory store.
    pub fn from_env() -> Self {
        if let Ok(val) = std::env::var("REPOSITORY_TYPE") {
            return val.parse().unwrap_or(Self::Local);
        }

        if std::env::var("DATABASE_URL").is_ok() || std::env::var("PG_DATABASE_URL").is_ok() {
            Self::Postgres
        } else {
            Self::Local
        }
    }
}

#[cfg(not(feature = "postgres-repo"))]
fn postgres_disabled<T>() -> RepositoryResult<T> {
    Err(RepositoryError::configuration(
        "Postgres repository feature not enabled",
    ))
}

/// Creates repositories behind `Arc<dyn ReferenceRangeRepository>`.
///
/// # Example
/// ```ignore
/// use lab_ranges::db::RepositoryFactory;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let repo = RepositoryFactory::from_env().await?;
///     assert!(repo.health_check().await?);
///     Ok(())
/// }
/// ```
pub struct RepositoryFactory;

impl RepositoryFactory {
    pub async fn create(
        repo_type: RepositoryType,
        postgres_config: Option<&PostgresConfig>,
    ) -> RepositoryResult<Arc<dyn ReferenceRangeRepository>> {
        Self::create_with_cache(repo_type, postgres_config, SchemaCache::default()).await
    }

    async fn create_with_cache(
        repo_type: RepositoryType,
        postgres_config: Option<&PostgresConfig>,
        cache: SchemaCache,
    ) -> RepositoryResult<Arc<dyn ReferenceRangeRepository>> {
        match repo_type {
            RepositoryType::Postgres => {
                #[cfg(feature = "postgres-repo")]
                {
                    let config = postgres_config.ok_or_else(|| {
                        RepositoryError::configuration(
                            "Postgres repository requires PostgresConfig",
                        )
                    })?;
                    let repo = PostgresRepository::with_schema_cache(config.clone(), cache)?;
                    Ok(Arc::new(repo) as Arc<dyn ReferenceRangeRepository>)
                }
                #[cfg(not(feature = "postgres-repo"))]
                {
                    let _ = (postgres_config, cache);
                    postgres_disabled()
                }
            }
            RepositoryType::Local => Ok(Arc::new(LocalRepository::with_schema_cache(
                SchemaInfo::modern(),
                cache,
            ))),
        }
    }

    /// Connect to Postgres, running migrations when the config asks for it.
    #[cfg(feature = "postgres-repo")]
    pub async fn create_postgres(
        config: &PostgresConfig,
    ) -> RepositoryResult<Arc<PostgresRepository>> {
        let repo = PostgresRepository::new(config.clone())?;
        Ok(Arc::new(repo))
    }

    /// In-memory repository with the modern schema.
    pub fn create_local() -> Arc<dyn ReferenceRangeRepository> {
        Arc::new(LocalRepository::new())
    }

    pub async fn from_env() -> RepositoryResult<Arc<dyn ReferenceRangeRepository>> {
        RepositoryBuilder::new().from_env()?.build().await
    }

    pub async fn from_config_file<P: AsRef<Path>>(
        config_path: P,
    ) -> RepositoryResult<Arc<dyn ReferenceRangeRepository>> {
        RepositoryBuilder::new()
            .from_config_file(config_path)?
            .build()
            .await
    }

    /// Uses `repository.toml` when one is found in the standard locations,
    /// the environment otherwise.
    pub async fn from_default_config() -> RepositoryResult<Arc<dyn ReferenceRangeRepository>> {
        match RepositoryConfig::default_location() {
            Some(path) => {
                info!(path = %path.display(), "loading repository configuration");
                Self::from_config_file(path).await
            }
            None => Self::from_env().await,
        }
    }
}

/// Fluent configuration for repository creation.
///
/// ```ignore
/// use std::time::Duration;
/// use lab_ranges::db::{RepositoryBuilder, RepositoryType};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let repo = RepositoryBuilder::new()
///     .repository_type(RepositoryType::Local)
///     .schema_cache_ttl(Duration::from_secs(5))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RepositoryBuilder {
    repo_type: RepositoryType,
    postgres_config: Option<PostgresConfig>,
    schema_cache_ttl: Option<Duration>,
}

impl RepositoryBuilder {
    /// Defaults to Postgres if configured, otherwise Local.
    pub fn new() -> Self {
        Self {
            repo_type: RepositoryType::from_env(),
            postgres_config: None,
            schema_cache_ttl: None,
        }
    }

    pub fn repository_type(mut self, repo_type: RepositoryType) -> Self {
        self.repo_type = repo_type;
        self
    }

    pub fn postgres_config(mut self, config: PostgresConfig) -> Self {
        self.postgres_config = Some(config);
        self
    }

    /// How long a tenant's introspected schema is trusted before re-reading.
    pub fn schema_cache_ttl(mut self, ttl: Duration) -> Self {
        self.schema_cache_ttl = Some(ttl);
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env(mut self) -> RepositoryResult<Self> {
        self.repo_type = RepositoryType::from_env();

        if self.repo_type == RepositoryType::Postgres {
            #[cfg(feature = "postgres-repo")]
            {
                let config = PostgresConfig::from_env().map_err(RepositoryError::configuration)?;
                self.postgres_config = Some(config);
            }
            #[cfg(not(feature = "postgres-repo"))]
            {
                return postgres_disabled();
            }
        }

        Ok(self)
    }

    /// Load configuration from a TOML file.
    pub fn from_config_file<P: AsRef<Path>>(self, config_path: P) -> RepositoryResult<Self> {
        let repo_config = RepositoryConfig::from_file(config_path)?;
        self.apply_config(&repo_config)
    }

    fn apply_config(mut self, repo_config: &RepositoryConfig) -> RepositoryResult<Self> {
        self.repo_type = repo_config.repository_type().map_err(|e| {
            RepositoryError::configuration(format!("Invalid repository type: {}", e))
        })?;
        self.postgres_config = repo_config.to_postgres_config()?;
        if let Some(secs) = repo_config.engine.schema_cache_ttl_secs {
            self.schema_cache_ttl = Some(Duration::from_secs(secs));
        }
        Ok(self)
    }

    pub async fn build(self) -> RepositoryResult<Arc<dyn ReferenceRangeRepository>> {
        let cache = match self.schema_cache_ttl {
            Some(ttl) => SchemaCache::new(ttl),
            None => SchemaCache::default(),
        };
        RepositoryFactory::create_with_cache(self.repo_type, self.postgres_config.as_ref(), cache)
            .await
    }
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
