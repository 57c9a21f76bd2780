//! Postgres repository implementation using Diesel.
//!
//! Tenant databases are not guaranteed to be at the same migration stage, so
//! nothing here uses a compile-time `table!` schema. Each request reads the
//! tenant's [`SchemaInfo`] from the schema cache (introspecting when it is
//! stale) and builds SQL for the columns that exist.
//!
//! ## Features
//!
//! - Connection pooling with r2d2
//! - Automatic retry for transient failures
//! - Per-analysis advisory locks around parameter syncs
//! - Optional migration execution
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL` or `PG_DATABASE_URL`: Connection string (required)
//! - `PG_POOL_MAX`: Maximum pool size (default: 10)
//! - `PG_POOL_MIN`: Minimum pool size (default: 1)
//! - `PG_CONN_TIMEOUT_SEC`: Connection timeout in seconds (default: 30)
//! - `PG_IDLE_TIMEOUT_SEC`: Idle connection timeout in seconds (default: 600)
//! - `PG_MAX_RETRIES`: Maximum retry attempts for transient failures (default: 3)
//! - `PG_RETRY_DELAY_MS`: Initial retry delay in milliseconds (default: 100)
//! - `PG_RUN_MIGRATIONS`: Create the modern tables at startup (default: true)

pub mod adapter;
pub mod introspect;
mod models;
pub mod store;

use async_trait::async_trait;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{info, warn};

use crate::db::repository::{
    ErrorContext, ParameterStore, PoolStats, ReferenceRangeRepository, RepositoryError,
    RepositoryResult, Retryable,
};
use crate::db::schema_cache::{SchemaCache, SchemaInfo, TenantKey};
use crate::models::{
    AnalysisId, Parameter, ParameterId, ParameterSpec, RangeId, RawRange, UnifiedRange,
};
use crate::services::error::{SyncError, SyncResult};
use crate::services::sync::{self, SyncOutcome};

use store::PgParameterStore;

type PgPool = Pool<ConnectionManager<PgConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("src/db/repositories/postgres/migrations");

/// Configuration for connecting to Postgres.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connection_timeout_sec: u64,
    pub idle_timeout_sec: u64,
    /// Maximum number of retry attempts for transient failures
    pub max_retries: u32,
    /// Initial retry delay in milliseconds (doubles with each retry)
    pub retry_delay_ms: u64,
    /// Run embedded migrations when the pool is created
    pub run_migrations: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_pool_size: 10,
            min_pool_size: 1,
            connection_timeout_sec: 30,
            idle_timeout_sec: 600,
            max_retries: 3,
            retry_delay_ms: 100,
            run_migrations: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl PostgresConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("PG_DATABASE_URL"))
            .map_err(|_| "DATABASE_URL or PG_DATABASE_URL must be set".to_string())?;

        let defaults = Self::default();
        Ok(Self {
            database_url,
            max_pool_size: env_parse("PG_POOL_MAX").unwrap_or(defaults.max_pool_size),
            min_pool_size: env_parse("PG_POOL_MIN").unwrap_or(defaults.min_pool_size),
            connection_timeout_sec: env_parse("PG_CONN_TIMEOUT_SEC")
                .unwrap_or(defaults.connection_timeout_sec),
            idle_timeout_sec: env_parse("PG_IDLE_TIMEOUT_SEC").unwrap_or(defaults.idle_timeout_sec),
            max_retries: env_parse("PG_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_delay_ms: env_parse("PG_RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
            run_migrations: env_parse("PG_RUN_MIGRATIONS").unwrap_or(defaults.run_migrations),
        })
    }

    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Diesel-backed repository for Postgres.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
    config: PostgresConfig,
    schema_cache: Arc<SchemaCache>,
    total_queries: Arc<AtomicU64>,
    failed_queries: Arc<AtomicU64>,
    retried_operations: Arc<AtomicU64>,
}

impl PostgresRepository {
    /// Create a new repository and, when configured, run pending migrations.
    pub fn new(config: PostgresConfig) -> RepositoryResult<Self> {
        Self::with_schema_cache(config, SchemaCache::new(crate::config::settings().schema_cache_ttl))
    }

    pub fn with_schema_cache(config: PostgresConfig, cache: SchemaCache) -> RepositoryResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.database_url);

        let pool = Pool::builder()
            .max_size(config.max_pool_size)
            .min_idle(Some(config.min_pool_size))
            .connection_timeout(Duration::from_secs(config.connection_timeout_sec))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_sec)))
            .test_on_check_out(true)
            .build(manager)
            .map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("create_pool")
                        .with_details(format!("max_size={}", config.max_pool_size)),
                )
            })?;

        if config.run_migrations {
            let mut conn = pool.get().map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("get_connection_for_migrations"),
                )
            })?;
            Self::run_migrations(&mut conn)?;
        }

        Ok(Self {
            pool,
            config,
            schema_cache: Arc::new(cache),
            total_queries: Arc::new(AtomicU64::new(0)),
            failed_queries: Arc::new(AtomicU64::new(0)),
            retried_operations: Arc::new(AtomicU64::new(0)),
        })
    }

    fn run_migrations(conn: &mut PgConnection) -> RepositoryResult<()> {
        let applied = conn.run_pending_migrations(MIGRATIONS).map_err(|e| {
            RepositoryError::internal(format!("Migration failed: {}", e))
                .with_operation("run_migrations")
        })?;
        if !applied.is_empty() {
            info!(count = applied.len(), "applied database migrations");
        }
        Ok(())
    }

    /// Execute a database operation with automatic retry for transient failures.
    ///
    /// The closure is retried up to `max_retries` times while the error it
    /// returns reports itself as retryable. Domain errors never are.
    async fn with_conn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<RepositoryError> + Retryable + Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, E> + Send + 'static + Clone,
    {
        let pool = self.pool.clone();
        let max_retries = self.config.max_retries;
        let retry_delay_ms = self.config.retry_delay_ms;
        let total_queries = self.total_queries.clone();
        let failed_queries = self.failed_queries.clone();
        let retried_operations = self.retried_operations.clone();

        task::spawn_blocking(move || {
            let mut last_error = None;
            let mut retry_delay = Duration::from_millis(retry_delay_ms);

            for attempt in 0..=max_retries {
                if attempt > 0 {
                    retried_operations.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(retry_delay);
                    retry_delay *= 2;
                }

                let mut conn = match pool.get() {
                    Ok(c) => c,
                    Err(e) => {
                        let err = RepositoryError::connection_with_context(
                            e.to_string(),
                            ErrorContext::new("get_connection")
                                .with_details(format!("attempt={}", attempt + 1)),
                        );
                        if attempt < max_retries {
                            last_error = Some(E::from(err));
                            continue;
                        }
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(E::from(err));
                    }
                };

                total_queries.fetch_add(1, Ordering::Relaxed);
                match f.clone()(&mut conn) {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_retryable() && attempt < max_retries => {
                        warn!(attempt = attempt + 1, "retrying database operation");
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => {
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                }
            }

            failed_queries.fetch_add(1, Ordering::Relaxed);
            Err(last_error.unwrap_or_else(|| {
                E::from(RepositoryError::internal(
                    "Max retries exceeded with no error captured",
                ))
            }))
        })
        .await
        .map_err(|e| {
            E::from(
                RepositoryError::internal(format!("Task join error: {}", e))
                    .with_operation("spawn_blocking"),
            )
        })?
    }

    /// Load the tenant's schema, open a transaction and run `f` inside it.
    ///
    /// A CHECK violation rolls back, invalidates the tenant's snapshot and
    /// re-reads it so the error reports what the constraint allows now.
    async fn in_transaction<T, F>(&self, tenant: &TenantKey, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgParameterStore<'_>, &SchemaInfo) -> SyncResult<T> + Send + 'static + Clone,
    {
        let cache = Arc::clone(&self.schema_cache);
        let tenant = tenant.clone();

        self.with_conn(move |conn: &mut PgConnection| {
            let schema = cache.load_with(&tenant, |previous| introspect::load_schema(conn, previous));

            let result = conn.transaction::<T, SyncError, _>(|conn| {
                let mut store = PgParameterStore::new(conn, &schema);
                f(&mut store, &schema)
            });

            result.map_err(|err| {
                if !err.is_constraint_fail() {
                    return err;
                }
                cache.invalidate(&tenant);
                let fresh =
                    cache.load_with(&tenant, |previous| introspect::load_schema(conn, previous));
                warn!(
                    tenant = %tenant,
                    allowed = ?fresh.allowed_sex_tokens(),
                    "sex constraint rejected a write; schema snapshot refreshed"
                );
                err.with_constraint_snapshot(
                    fresh.allowed_sex_tokens(),
                    fresh.constraint_definitions.clone(),
                )
            })
        })
        .await
    }
}

#[async_trait]
impl ReferenceRangeRepository for PostgresRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        self.with_conn(|conn: &mut PgConnection| {
            sql_query("SELECT 1")
                .execute(conn)
                .map(|_| true)
                .map_err(RepositoryError::from)
        })
        .await
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        let state = self.pool.state();
        Some(PoolStats {
            connections_in_use: state.connections - state.idle_connections,
            idle_connections: state.idle_connections,
            total_connections: state.connections,
            max_size: self.config.max_pool_size,
            total_queries: self.total_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            retried_operations: self.retried_operations.load(Ordering::Relaxed),
        })
    }

    async fn schema_info(&self, tenant: &TenantKey) -> Arc<SchemaInfo> {
        if let Some(info) = self.schema_cache.get_fresh(tenant) {
            return info;
        }

        let cache = Arc::clone(&self.schema_cache);
        let owned = tenant.clone();
        let loaded: RepositoryResult<Arc<SchemaInfo>> = self
            .with_conn(move |conn: &mut PgConnection| {
                Ok(cache.load_with(&owned, |previous| introspect::load_schema(conn, previous)))
            })
            .await;

        match loaded {
            Ok(info) => info,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "no connection for schema introspection");
                self.schema_cache
                    .last_known(tenant)
                    .unwrap_or_else(|| Arc::new(SchemaInfo::default()))
            }
        }
    }

    fn invalidate_schema(&self, tenant: &TenantKey) {
        self.schema_cache.invalidate(tenant);
    }

    async fn list_parameters(
        &self,
        tenant: &TenantKey,
        analysis_id: AnalysisId,
    ) -> SyncResult<Vec<Parameter>> {
        self.in_transaction(tenant, move |store, _| Ok(store.load_parameters(analysis_id)?))
            .await
    }

    async fn list_reference_ranges(
        &self,
        tenant: &TenantKey,
        parameter_id: ParameterId,
    ) -> SyncResult<Vec<UnifiedRange>> {
        self.in_transaction(tenant, move |store, schema| {
            sync::list_ranges(store, schema, parameter_id)
        })
        .await
    }

    async fn insert_reference_range(
        &self,
        tenant: &TenantKey,
        parameter_id: ParameterId,
        raw: RawRange,
    ) -> SyncResult<UnifiedRange> {
        self.in_transaction(tenant, move |store, schema| {
            sync::insert_single_range(store, schema, parameter_id, &raw)
        })
        .await
    }

    async fn update_reference_range(
        &self,
        tenant: &TenantKey,
        range_id: RangeId,
        raw: RawRange,
    ) -> SyncResult<UnifiedRange> {
        self.in_transaction(tenant, move |store, schema| {
            sync::update_single_range(store, schema, range_id, &raw)
        })
        .await
    }

    async fn delete_reference_range(
        &self,
        tenant: &TenantKey,
        range_id: RangeId,
    ) -> SyncResult<()> {
        self.in_transaction(tenant, move |store, _| sync::delete_single_range(store, range_id))
            .await
    }

    async fn sync_parameters(
        &self,
        tenant: &TenantKey,
        analysis_id: AnalysisId,
        specs: Vec<ParameterSpec>,
    ) -> SyncResult<SyncOutcome> {
        self.in_transaction(tenant, move |store, schema| {
            sync::sync_parameters(store, schema, analysis_id, &specs)
        })
        .await
    }
}
