//! Storage traits for parameters and reference ranges.
//!
//! Two levels exist:
//!
//! - [`ParameterStore`] is synchronous and transaction-scoped. An implementation
//!   wraps one open transaction (a diesel connection inside
//!   `Connection::transaction`, or a scratch copy of the in-memory state) and is
//!   what the sync coordinator in [`crate::services::sync`] drives.
//! - [`ReferenceRangeRepository`] is the async surface the HTTP layer calls.
//!   Implementations open a transaction, hand a `ParameterStore` to the service
//!   functions, and commit or roll back on the result.

pub mod error;

pub use error::{ConstraintKind, ErrorContext, RepositoryError, RepositoryResult, Retryable};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::db::schema_cache::{SchemaInfo, TenantKey};
use crate::models::{
    AnalysisId, Parameter, ParameterFields, ParameterId, ParameterSpec, RangeId, RawRange,
    StorableRange, UnifiedRange,
};
use crate::services::error::SyncResult;
use crate::services::sync::SyncOutcome;

/// Row-level operations available inside one transaction.
///
/// Range rows passed in already carry the storage sex token. Range rows read
/// back carry whatever the database holds.
pub trait ParameterStore {
    /// Serialize concurrent writers of one analysis until the transaction ends.
    fn lock_analysis(&mut self, analysis_id: AnalysisId) -> RepositoryResult<()>;

    fn parameter_ids(&mut self, analysis_id: AnalysisId) -> RepositoryResult<Vec<ParameterId>>;

    fn parameter_exists(&mut self, parameter_id: ParameterId) -> RepositoryResult<bool>;

    /// Delete parameters together with all of their ranges.
    fn delete_parameters(&mut self, ids: &[ParameterId]) -> RepositoryResult<usize>;

    fn insert_parameter(
        &mut self,
        analysis_id: AnalysisId,
        fields: &ParameterFields,
    ) -> RepositoryResult<ParameterId>;

    fn update_parameter(
        &mut self,
        parameter_id: ParameterId,
        fields: &ParameterFields,
    ) -> RepositoryResult<()>;

    /// Parameters of an analysis ordered by position, then id.
    fn load_parameters(&mut self, analysis_id: AnalysisId) -> RepositoryResult<Vec<Parameter>>;

    fn delete_ranges(&mut self, parameter_id: ParameterId) -> RepositoryResult<usize>;

    fn insert_range(
        &mut self,
        parameter_id: ParameterId,
        range: &StorableRange,
    ) -> RepositoryResult<RangeId>;

    /// Ranges of a parameter ordered by sex, start age, then id.
    fn ranges_for_parameter(
        &mut self,
        parameter_id: ParameterId,
    ) -> RepositoryResult<Vec<UnifiedRange>>;

    fn range_owner(&mut self, range_id: RangeId) -> RepositoryResult<Option<ParameterId>>;

    fn update_range(&mut self, range_id: RangeId, range: &StorableRange) -> RepositoryResult<()>;

    /// Returns `false` when no row had that id.
    fn delete_range(&mut self, range_id: RangeId) -> RepositoryResult<bool>;
}

/// Connection pool statistics reported by `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub connections_in_use: u32,
    pub idle_connections: u32,
    pub total_connections: u32,
    pub max_size: u32,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub retried_operations: u64,
}

/// Async repository used by the HTTP layer.
///
/// Every method takes the tenant so schema snapshots are never shared
/// between tenant databases.
#[async_trait]
pub trait ReferenceRangeRepository: Send + Sync {
    async fn health_check(&self) -> RepositoryResult<bool>;

    /// Pool statistics, for backends that pool connections.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }

    /// Cached schema snapshot for a tenant. Never fails.
    async fn schema_info(&self, tenant: &TenantKey) -> Arc<SchemaInfo>;

    /// Drop the cached snapshot so the next request introspects again.
    fn invalidate_schema(&self, tenant: &TenantKey);

    async fn list_parameters(
        &self,
        tenant: &TenantKey,
        analysis_id: AnalysisId,
    ) -> SyncResult<Vec<Parameter>>;

    async fn list_reference_ranges(
        &self,
        tenant: &TenantKey,
        parameter_id: ParameterId,
    ) -> SyncResult<Vec<UnifiedRange>>;

    async fn insert_reference_range(
        &self,
        tenant: &TenantKey,
        parameter_id: ParameterId,
        raw: RawRange,
    ) -> SyncResult<UnifiedRange>;

    async fn update_reference_range(
        &self,
        tenant: &TenantKey,
        range_id: RangeId,
        raw: RawRange,
    ) -> SyncResult<UnifiedRange>;

    async fn delete_reference_range(&self, tenant: &TenantKey, range_id: RangeId)
        -> SyncResult<()>;

    /// Apply a full parameter list to an analysis in one transaction.
    async fn sync_parameters(
        &self,
        tenant: &TenantKey,
        analysis_id: AnalysisId,
        specs: Vec<ParameterSpec>,
    ) -> SyncResult<SyncOutcome>;
}
