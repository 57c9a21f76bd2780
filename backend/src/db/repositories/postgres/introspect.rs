//! Live schema discovery for one tenant database.

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Text;
use tracing::{debug, info};

use super::adapter::{adapter_for, RangeField};
use super::models::{ColumnNameRow, ConstraintDefinitionRow};
use crate::db::constraint::ConstraintSnapshot;
use crate::db::repository::{ErrorContext, RepositoryError, RepositoryResult};
use crate::db::schema_cache::{
    ColumnSet, RangeTableKind, SchemaInfo, LEGACY_RANGE_TABLE, MODERN_RANGE_TABLE, PARAMETER_TABLE,
};
use crate::services::sex_tokens::SexVocabulary;

const COLUMNS_SQL: &str = "SELECT column_name::text AS column_name \
     FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1";

const CHECK_CONSTRAINTS_SQL: &str = "SELECT pg_get_constraintdef(c.oid)::text AS definition \
     FROM pg_constraint c \
     JOIN pg_class t ON t.oid = c.conrelid \
     JOIN pg_namespace n ON n.oid = t.relnamespace \
     WHERE c.contype = 'c' AND n.nspname = current_schema() AND t.relname::text = $1";

pub fn table_columns(conn: &mut PgConnection, table: &str) -> RepositoryResult<ColumnSet> {
    let rows = sql_query(COLUMNS_SQL)
        .bind::<Text, _>(table)
        .load::<ColumnNameRow>(conn)
        .map_err(|e| {
            RepositoryError::from(e).with_operation(format!("introspect_columns:{}", table))
        })?;
    Ok(rows.into_iter().map(|r| r.column_name).collect())
}

/// CHECK definitions on `table` that mention `sex_column`.
pub fn sex_constraints(
    conn: &mut PgConnection,
    table: &str,
    sex_column: &str,
) -> RepositoryResult<Vec<String>> {
    let needle = sex_column.to_lowercase();
    let rows = sql_query(CHECK_CONSTRAINTS_SQL)
        .bind::<Text, _>(table)
        .load::<ConstraintDefinitionRow>(conn)
        .map_err(|e| RepositoryError::from(e).with_operation("introspect_constraints"))?;
    Ok(rows
        .into_iter()
        .map(|r| r.definition)
        .filter(|d| d.to_lowercase().contains(&needle))
        .collect())
}

/// Read the tenant's schema. `previous` supplies the vocabulary to keep when
/// the constraint cannot be interpreted.
pub fn load_schema(
    conn: &mut PgConnection,
    previous: Option<&SchemaInfo>,
) -> RepositoryResult<SchemaInfo> {
    let parameter_columns = table_columns(conn, PARAMETER_TABLE)?;
    if parameter_columns.is_empty() {
        return Err(RepositoryError::query_with_context(
            format!("table {} does not exist", PARAMETER_TABLE),
            ErrorContext::new("load_schema").with_entity(PARAMETER_TABLE),
        ));
    }

    let modern_columns = table_columns(conn, MODERN_RANGE_TABLE)?;
    let (range_table, range_columns) = if !modern_columns.is_empty() {
        (RangeTableKind::Modern, modern_columns)
    } else {
        (RangeTableKind::Legacy, table_columns(conn, LEGACY_RANGE_TABLE)?)
    };

    let adapter = adapter_for(range_table);
    let definitions = sex_constraints(conn, adapter.table(), adapter.column(RangeField::Sex))?;

    let fallback = previous
        .map(|p| p.vocabulary.clone())
        .unwrap_or_else(SexVocabulary::default);
    let vocabulary = ConstraintSnapshot::new(definitions.clone(), fallback).vocabulary();

    debug!(
        table = adapter.table(),
        constraints = definitions.len(),
        "introspected range table"
    );
    if previous.map(|p| &p.vocabulary) != Some(&vocabulary) {
        info!(
            table = adapter.table(),
            tokens = ?vocabulary.tokens(),
            legacy_active = vocabulary.legacy_active,
            "sex vocabulary loaded"
        );
    }

    Ok(SchemaInfo {
        parameter_columns,
        range_columns,
        range_table,
        vocabulary,
        constraint_definitions: definitions,
    })
}
