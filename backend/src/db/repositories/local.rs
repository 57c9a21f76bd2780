//! In-memory local repository implementation.
//!
//! Stores parameters and ranges in ordered maps and behaves like a single
//! tenant database: it enforces the sex CHECK constraint described by its live
//! schema and a unique key on `(parameter, sex, age_min, age_max)`. Each
//! transaction works on a copy of the data that replaces the original only on
//! success, so a failed sync leaves nothing behind.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::db::repository::{
    ConstraintKind, ParameterStore, ReferenceRangeRepository, RepositoryError, RepositoryResult,
};
use crate::db::schema_cache::{SchemaCache, SchemaInfo, TenantKey};
use crate::models::{
    AnalysisId, Parameter, ParameterFields, ParameterId, ParameterSpec, RangeId, RawRange,
    StorableRange, UnifiedRange,
};
use crate::services::error::{SyncError, SyncResult};
use crate::services::sync::{self, SyncOutcome};

/// In-memory repository for tests and local development.
///
/// # Example
/// ```
/// use lab_ranges::db::repositories::LocalRepository;
/// use lab_ranges::db::schema_cache::SchemaInfo;
///
/// // A tenant that was never migrated: letters are stored.
/// let repo = LocalRepository::with_schema(SchemaInfo::legacy());
/// assert_eq!(repo.range_count(), 0);
/// ```
#[derive(Clone)]
pub struct LocalRepository {
    data: Arc<Mutex<LocalData>>,
    live_schema: Arc<RwLock<SchemaInfo>>,
    schema_cache: Arc<SchemaCache>,
}

#[derive(Debug, Clone)]
struct StoredRange {
    parameter_id: ParameterId,
    row: StorableRange,
}

#[derive(Debug, Clone)]
struct LocalData {
    parameters: BTreeMap<ParameterId, Parameter>,
    ranges: BTreeMap<RangeId, StoredRange>,
    next_parameter_id: i64,
    next_range_id: i64,
    is_healthy: bool,
}

impl Default for LocalData {
    fn default() -> Self {
        Self {
            parameters: BTreeMap::new(),
            ranges: BTreeMap::new(),
            next_parameter_id: 1,
            next_range_id: 1,
            is_healthy: true,
        }
    }
}

impl LocalRepository {
    /// Create an empty repository with a fully migrated schema.
    pub fn new() -> Self {
        Self::with_schema(SchemaInfo::modern())
    }

    pub fn with_schema(schema: SchemaInfo) -> Self {
        Self::with_schema_cache(schema, SchemaCache::default())
    }

    pub fn with_schema_cache(schema: SchemaInfo, cache: SchemaCache) -> Self {
        Self {
            data: Arc::new(Mutex::new(LocalData::default())),
            live_schema: Arc::new(RwLock::new(schema)),
            schema_cache: Arc::new(cache),
        }
    }

    /// Change the schema the "database" enforces, as a migration would.
    /// Cached snapshots are left alone until they expire or are invalidated.
    pub fn set_live_schema(&self, schema: SchemaInfo) {
        *self.live_schema.write() = schema;
    }

    /// Set the health status for testing connection failures.
    pub fn set_healthy(&self, healthy: bool) {
        self.data.lock().is_healthy = healthy;
    }

    /// Add a parameter directly, bypassing sync.
    pub fn seed_parameter(&self, analysis_id: AnalysisId, name: &str) -> ParameterId {
        let mut data = self.data.lock();
        let position = data
            .parameters
            .values()
            .filter(|p| p.analysis_id == analysis_id)
            .count();
        let fields = ParameterFields {
            id: None,
            name: name.to_string(),
            unit: None,
            position: i32::try_from(position + 1).ok(),
            decimal_places: None,
        };
        data.insert_parameter(analysis_id, &fields)
    }

    pub fn parameter_count(&self) -> usize {
        self.data.lock().parameters.len()
    }

    pub fn range_count(&self) -> usize {
        self.data.lock().ranges.len()
    }

    /// Rows exactly as stored, sex column untouched.
    pub fn stored_ranges(&self, parameter_id: ParameterId) -> Vec<StorableRange> {
        self.data
            .lock()
            .ranges
            .values()
            .filter(|r| r.parameter_id == parameter_id)
            .map(|r| r.row.clone())
            .collect()
    }

    fn load_schema(&self, tenant: &TenantKey) -> Arc<SchemaInfo> {
        self.schema_cache
            .load_with(tenant, |_| Ok(self.live_schema.read().clone()))
    }

    /// Run `f` on a scratch copy of the data and keep the copy only on success.
    fn transaction<T>(
        &self,
        tenant: &TenantKey,
        f: impl FnOnce(&mut LocalTransaction<'_>, &SchemaInfo) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let schema = self.load_schema(tenant);
        let live = self.live_schema.read().clone();

        let mut data = self.data.lock();
        if !data.is_healthy {
            return Err(RepositoryError::connection("Database is not healthy").into());
        }

        let mut scratch = data.clone();
        let result = f(
            &mut LocalTransaction {
                data: &mut scratch,
                live: &live,
            },
            &schema,
        );

        match result {
            Ok(value) => {
                *data = scratch;
                Ok(value)
            }
            Err(err) => {
                drop(data);
                debug!(tenant = %tenant, code = err.code(), "local transaction rolled back");
                Err(self.on_failure(tenant, err))
            }
        }
    }

    /// A CHECK rejection means the cached vocabulary is out of date.
    fn on_failure(&self, tenant: &TenantKey, err: SyncError) -> SyncError {
        if !err.is_constraint_fail() {
            return err;
        }
        self.schema_cache.invalidate(tenant);
        let fresh = self.load_schema(tenant);
        err.with_constraint_snapshot(
            fresh.allowed_sex_tokens(),
            fresh.constraint_definitions.clone(),
        )
    }
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalData {
    fn insert_parameter(&mut self, analysis_id: AnalysisId, fields: &ParameterFields) -> ParameterId {
        let id = ParameterId::new(self.next_parameter_id);
        self.next_parameter_id += 1;
        self.parameters.insert(
            id,
            Parameter {
                id,
                analysis_id,
                name: fields.name.clone(),
                unit: fields.unit.clone(),
                decimal_places: fields.decimal_places,
                position: fields.position,
            },
        );
        id
    }
}

/// One open transaction over the scratch copy.
struct LocalTransaction<'a> {
    data: &'a mut LocalData,
    live: &'a SchemaInfo,
}

impl LocalTransaction<'_> {
    fn check_row(
        &self,
        parameter_id: ParameterId,
        row: &StorableRange,
        skip: Option<RangeId>,
    ) -> RepositoryResult<()> {
        let allowed = self.live.vocabulary.storage_tokens();
        if !allowed.contains(&row.sex.as_str()) {
            return Err(RepositoryError::constraint(
                ConstraintKind::Check,
                format!(
                    "new row for relation \"{}\" violates check constraint on sex: '{}'",
                    self.live.range_table.table_name(),
                    row.sex
                ),
            ));
        }

        let duplicate = self.data.ranges.iter().any(|(id, other)| {
            Some(*id) != skip
                && other.parameter_id == parameter_id
                && other.row.sex == row.sex
                && other.row.age_min == row.age_min
                && other.row.age_max == row.age_max
        });
        if duplicate {
            return Err(RepositoryError::constraint(
                ConstraintKind::Unique,
                format!(
                    "range ({}, {}, {:?}, {:?}) already exists",
                    parameter_id, row.sex, row.age_min, row.age_max
                ),
            ));
        }
        Ok(())
    }
}

impl ParameterStore for LocalTransaction<'_> {
    fn lock_analysis(&mut self, _analysis_id: AnalysisId) -> RepositoryResult<()> {
        // The data mutex is already held for the whole transaction.
        Ok(())
    }

    fn parameter_ids(&mut self, analysis_id: AnalysisId) -> RepositoryResult<Vec<ParameterId>> {
        Ok(self
            .data
            .parameters
            .values()
            .filter(|p| p.analysis_id == analysis_id)
            .map(|p| p.id)
            .collect())
    }

    fn parameter_exists(&mut self, parameter_id: ParameterId) -> RepositoryResult<bool> {
        Ok(self.data.parameters.contains_key(&parameter_id))
    }

    fn delete_parameters(&mut self, ids: &[ParameterId]) -> RepositoryResult<usize> {
        self.data
            .ranges
            .retain(|_, range| !ids.contains(&range.parameter_id));
        Ok(ids
            .iter()
            .filter(|id| self.data.parameters.remove(id).is_some())
            .count())
    }

    fn insert_parameter(
        &mut self,
        analysis_id: AnalysisId,
        fields: &ParameterFields,
    ) -> RepositoryResult<ParameterId> {
        Ok(self.data.insert_parameter(analysis_id, fields))
    }

    fn update_parameter(
        &mut self,
        parameter_id: ParameterId,
        fields: &ParameterFields,
    ) -> RepositoryResult<()> {
        let parameter = self.data.parameters.get_mut(&parameter_id).ok_or_else(|| {
            RepositoryError::not_found(format!("Parameter {} not found", parameter_id))
        })?;
        parameter.name = fields.name.clone();
        parameter.unit = fields.unit.clone();
        parameter.position = fields.position;
        parameter.decimal_places = fields.decimal_places;
        Ok(())
    }

    fn load_parameters(&mut self, analysis_id: AnalysisId) -> RepositoryResult<Vec<Parameter>> {
        let mut parameters: Vec<Parameter> = self
            .data
            .parameters
            .values()
            .filter(|p| p.analysis_id == analysis_id)
            .cloned()
            .collect();
        parameters.sort_by_key(|p| (p.position.is_none(), p.position, p.id));
        Ok(parameters)
    }

    fn delete_ranges(&mut self, parameter_id: ParameterId) -> RepositoryResult<usize> {
        let before = self.data.ranges.len();
        self.data
            .ranges
            .retain(|_, range| range.parameter_id != parameter_id);
        Ok(before - self.data.ranges.len())
    }

    fn insert_range(
        &mut self,
        parameter_id: ParameterId,
        range: &StorableRange,
    ) -> RepositoryResult<RangeId> {
        if !self.data.parameters.contains_key(&parameter_id) {
            return Err(RepositoryError::constraint(
                ConstraintKind::ForeignKey,
                format!("parameter {} does not exist", parameter_id),
            ));
        }
        self.check_row(parameter_id, range, None)?;

        let id = RangeId::new(self.data.next_range_id);
        self.data.next_range_id += 1;
        self.data.ranges.insert(
            id,
            StoredRange {
                parameter_id,
                row: range.clone(),
            },
        );
        Ok(id)
    }

    fn ranges_for_parameter(
        &mut self,
        parameter_id: ParameterId,
    ) -> RepositoryResult<Vec<UnifiedRange>> {
        let mut ranges: Vec<UnifiedRange> = self
            .data
            .ranges
            .iter()
            .filter(|(_, r)| r.parameter_id == parameter_id)
            .map(|(id, r)| UnifiedRange::from_storable(*id, &r.row))
            .collect();
        ranges.sort_by(|a, b| (&a.sex, a.age_min, a.id).cmp(&(&b.sex, b.age_min, b.id)));
        Ok(ranges)
    }

    fn range_owner(&mut self, range_id: RangeId) -> RepositoryResult<Option<ParameterId>> {
        Ok(self.data.ranges.get(&range_id).map(|r| r.parameter_id))
    }

    fn update_range(&mut self, range_id: RangeId, range: &StorableRange) -> RepositoryResult<()> {
        let parameter_id = self
            .data
            .ranges
            .get(&range_id)
            .map(|r| r.parameter_id)
            .ok_or_else(|| RepositoryError::not_found(format!("Range {} not found", range_id)))?;
        self.check_row(parameter_id, range, Some(range_id))?;

        if let Some(stored) = self.data.ranges.get_mut(&range_id) {
            stored.row = range.clone();
        }
        Ok(())
    }

    fn delete_range(&mut self, range_id: RangeId) -> RepositoryResult<bool> {
        Ok(self.data.ranges.remove(&range_id).is_some())
    }
}

#[async_trait]
impl ReferenceRangeRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        Ok(self.data.lock().is_healthy)
    }

    async fn schema_info(&self, tenant: &TenantKey) -> Arc<SchemaInfo> {
        self.load_schema(tenant)
    }

    fn invalidate_schema(&self, tenant: &TenantKey) {
        self.schema_cache.invalidate(tenant);
    }

    async fn list_parameters(
        &self,
        tenant: &TenantKey,
        analysis_id: AnalysisId,
    ) -> SyncResult<Vec<Parameter>> {
        self.transaction(tenant, |tx, _| Ok(tx.load_parameters(analysis_id)?))
    }

    async fn list_reference_ranges(
        &self,
        tenant: &TenantKey,
        parameter_id: ParameterId,
    ) -> SyncResult<Vec<UnifiedRange>> {
        self.transaction(tenant, |tx, schema| {
            sync::list_ranges(tx, schema, parameter_id)
        })
    }

    async fn insert_reference_range(
        &self,
        tenant: &TenantKey,
        parameter_id: ParameterId,
        raw: RawRange,
    ) -> SyncResult<UnifiedRange> {
        self.transaction(tenant, |tx, schema| {
            sync::insert_single_range(tx, schema, parameter_id, &raw)
        })
    }

    async fn update_reference_range(
        &self,
        tenant: &TenantKey,
        range_id: RangeId,
        raw: RawRange,
    ) -> SyncResult<UnifiedRange> {
        self.transaction(tenant, |tx, schema| {
            sync::update_single_range(tx, schema, range_id, &raw)
        })
    }

    async fn delete_reference_range(
        &self,
        tenant: &TenantKey,
        range_id: RangeId,
    ) -> SyncResult<()> {
        self.transaction(tenant, |tx, _| sync::delete_single_range(tx, range_id))
    }

    async fn sync_parameters(
        &self,
        tenant: &TenantKey,
        analysis_id: AnalysisId,
        specs: Vec<ParameterSpec>,
    ) -> SyncResult<SyncOutcome> {
        self.transaction(tenant, |tx, schema| {
            sync::sync_parameters(tx, schema, analysis_id, &specs)
        })
    }
}
