//! Per-tenant schema snapshots with a short time-to-live.
//!
//! Each tenant database may be at a different migration stage, so every
//! snapshot is keyed by the tenant it was read from. Introspection failures
//! never reach callers: the last good snapshot for the tenant (or the modern
//! defaults) is served instead.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::repository::RepositoryResult;
use crate::services::sex_tokens::SexVocabulary;

/// Parameter table shared by both schema generations.
pub const PARAMETER_TABLE: &str = "analysis_parameters";
/// Range table created by the current migrations.
pub const MODERN_RANGE_TABLE: &str = "analysis_reference_ranges";
/// Range table of databases that predate the migrations.
pub const LEGACY_RANGE_TABLE: &str = "reference_ranges";

/// Identifies the tenant database a request is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey(String);

impl TenantKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantKey {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Columns present on one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSet(BTreeSet<String>);

impl ColumnSet {
    pub fn contains(&self, column: &str) -> bool {
        self.0.contains(column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ColumnSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Which generation of range table the tenant uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeTableKind {
    Modern,
    Legacy,
}

impl RangeTableKind {
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Modern => MODERN_RANGE_TABLE,
            Self::Legacy => LEGACY_RANGE_TABLE,
        }
    }
}

/// Everything the engine needs to know about a tenant's schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaInfo {
    pub parameter_columns: ColumnSet,
    pub range_columns: ColumnSet,
    pub range_table: RangeTableKind,
    pub vocabulary: SexVocabulary,
    /// Raw CHECK definitions mentioning the sex column, for diagnostics.
    pub constraint_definitions: Vec<String>,
}

impl SchemaInfo {
    /// Fully migrated schema with the default vocabulary.
    pub fn modern() -> Self {
        Self {
            parameter_columns: [
                "id",
                "analysis_id",
                "name",
                "unit",
                "decimal_places",
                "position",
            ]
            .into_iter()
            .collect(),
            range_columns: [
                "id",
                "parameter_id",
                "sex",
                "age_min",
                "age_max",
                "age_min_unit",
                "lower",
                "upper",
                "text_value",
                "notes",
                "unit",
            ]
            .into_iter()
            .collect(),
            range_table: RangeTableKind::Modern,
            vocabulary: SexVocabulary::default(),
            constraint_definitions: Vec::new(),
        }
    }

    /// Legacy table with letters enforced, as found on unmigrated tenants.
    pub fn legacy() -> Self {
        Self {
            range_columns: [
                "id",
                "parameter_id",
                "sexo",
                "edad_min",
                "edad_max",
                "unidad_edad",
                "valor_min",
                "valor_max",
                "valor_texto",
                "notas",
            ]
            .into_iter()
            .collect(),
            range_table: RangeTableKind::Legacy,
            vocabulary: SexVocabulary {
                legacy_active: true,
                ..SexVocabulary::default()
            },
            constraint_definitions: vec![
                "CHECK (((sexo)::text = ANY ((ARRAY['M'::character varying, 'F'::character varying, 'O'::character varying])::text[])))"
                    .to_string(),
            ],
            ..Self::modern()
        }
    }

    pub fn with_vocabulary(mut self, vocabulary: SexVocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    /// Sex values the live constraint accepts, for error reports.
    pub fn allowed_sex_tokens(&self) -> Vec<String> {
        self.vocabulary
            .storage_tokens()
            .iter()
            .map(|t| t.to_string())
            .collect()
    }
}

impl Default for SchemaInfo {
    fn default() -> Self {
        Self::modern()
    }
}

#[derive(Debug, Clone)]
struct CachedSchema {
    info: Arc<SchemaInfo>,
    loaded_at: Instant,
    stale: bool,
}

/// Tenant-keyed schema cache.
#[derive(Debug)]
pub struct SchemaCache {
    ttl: Duration,
    entries: RwLock<HashMap<TenantKey, CachedSchema>>,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Snapshot for `tenant` if it is still within its time-to-live.
    pub fn get_fresh(&self, tenant: &TenantKey) -> Option<Arc<SchemaInfo>> {
        let entries = self.entries.read();
        entries
            .get(tenant)
            .filter(|e| !e.stale && e.loaded_at.elapsed() < self.ttl)
            .map(|e| Arc::clone(&e.info))
    }

    /// Last snapshot stored for `tenant`, fresh or not.
    pub fn last_known(&self, tenant: &TenantKey) -> Option<Arc<SchemaInfo>> {
        self.entries.read().get(tenant).map(|e| Arc::clone(&e.info))
    }

    pub fn store(&self, tenant: &TenantKey, info: SchemaInfo) -> Arc<SchemaInfo> {
        let info = Arc::new(info);
        self.entries.write().insert(
            tenant.clone(),
            CachedSchema {
                info: Arc::clone(&info),
                loaded_at: Instant::now(),
                stale: false,
            },
        );
        info
    }

    /// Force the next load for `tenant` to introspect again. The current
    /// snapshot stays available as the last known good one.
    pub fn invalidate(&self, tenant: &TenantKey) {
        if let Some(entry) = self.entries.write().get_mut(tenant) {
            entry.stale = true;
            debug!(tenant = %tenant, "schema cache invalidated");
        }
    }

    /// Return the fresh snapshot, or run `loader` with the previous one.
    ///
    /// A loader failure is logged and answered with the previous snapshot, or
    /// the modern defaults when the tenant was never loaded.
    pub fn load_with<F>(&self, tenant: &TenantKey, loader: F) -> Arc<SchemaInfo>
    where
        F: FnOnce(Option<&SchemaInfo>) -> RepositoryResult<SchemaInfo>,
    {
        if let Some(info) = self.get_fresh(tenant) {
            return info;
        }

        let previous = self.last_known(tenant);
        match loader(previous.as_deref()) {
            Ok(info) => self.store(tenant, info),
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "schema introspection failed, using last known schema");
                previous.unwrap_or_else(|| Arc::new(SchemaInfo::default()))
            }
        }
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SCHEMA_CACHE_TTL)
    }
}
