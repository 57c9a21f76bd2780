//! Storage for analysis parameters and their reference ranges.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  HTTP layer (axum handlers)                             │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │ Arc<dyn ReferenceRangeRepository>
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Repository (postgres | local)                          │
//! │  - picks the tenant schema from the SchemaCache         │
//! │  - opens one transaction per request                    │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │ &mut dyn ParameterStore
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  services::sync - parameter sync and single-range edits │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! - `repository`: the `ParameterStore` and `ReferenceRangeRepository` traits
//! - `schema_cache`: per-tenant snapshot of columns and sex vocabulary
//! - `constraint`: reads allowed sex literals out of CHECK definitions
//! - `repositories::postgres`: Diesel implementation with runtime SQL
//! - `repositories::local`: in-memory implementation for tests and development
//! - `factory`, `repo_config`: backend selection

// Feature flag priority: postgres > local
#[cfg(not(any(feature = "postgres-repo", feature = "local-repo")))]
compile_error!("Enable at least one repository backend feature.");

pub mod constraint;
pub mod factory;
pub mod repo_config;
pub mod repositories;
pub mod repository;
pub mod schema_cache;

#[cfg(feature = "postgres-repo")]
pub use repositories::postgres::PostgresConfig;
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    _private: (),
}

pub use factory::{RepositoryBuilder, RepositoryFactory, RepositoryType};
pub use repo_config::RepositoryConfig;
pub use repositories::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use repositories::PostgresRepository;
pub use repository::{
    ConstraintKind, ErrorContext, ParameterStore, PoolStats, ReferenceRangeRepository,
    RepositoryError, RepositoryResult, Retryable,
};
pub use schema_cache::{SchemaCache, SchemaInfo, TenantKey};

use anyhow::{Context, Result};
use std::sync::{Arc, OnceLock};

/// Global repository instance initialized once per process.
static REPOSITORY: OnceLock<Arc<dyn ReferenceRangeRepository>> = OnceLock::new();

/// Build the repository selected by `repository.toml` (or the environment
/// when there is none) and install it globally.
///
/// Calling it again after a successful init is a no-op.
pub async fn init_repository() -> Result<Arc<dyn ReferenceRangeRepository>> {
    if let Some(repo) = REPOSITORY.get() {
        return Ok(Arc::clone(repo));
    }

    let repo = RepositoryFactory::from_default_config()
        .await
        .context("Failed to initialize repository")?;
    let _ = REPOSITORY.set(Arc::clone(&repo));
    Ok(REPOSITORY.get().cloned().unwrap_or(repo))
}
