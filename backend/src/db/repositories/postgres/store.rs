//! [`ParameterStore`] over one open diesel transaction.

use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Integer, Nullable, Text, Double};

use super::adapter::{adapter_for, RangeField, RangeTableAdapter};
use super::models::{ExistsRow, IdRow, OwnerRow, ParameterRow, RangeRow};
use crate::db::repository::{ErrorContext, ParameterStore, RepositoryError, RepositoryResult};
use crate::db::schema_cache::{SchemaInfo, PARAMETER_TABLE};
use crate::models::{
    AnalysisId, Parameter, ParameterFields, ParameterId, RangeId, StorableRange, UnifiedRange,
};

type BoxedQuery = BoxedSqlQuery<'static, Pg, SqlQuery>;

/// Optional scalar columns of the parameter table.
#[derive(Debug, Clone, Copy)]
enum ParameterColumn {
    Unit,
    DecimalPlaces,
    Position,
}

impl ParameterColumn {
    const ALL: [ParameterColumn; 3] = [Self::Unit, Self::DecimalPlaces, Self::Position];

    fn name(self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::DecimalPlaces => "decimal_places",
            Self::Position => "position",
        }
    }

    fn bind(self, query: BoxedQuery, fields: &ParameterFields) -> BoxedQuery {
        match self {
            Self::Unit => query.bind::<Nullable<Text>, _>(fields.unit.clone()),
            Self::DecimalPlaces => query.bind::<Nullable<Integer>, _>(fields.decimal_places),
            Self::Position => query.bind::<Nullable<Integer>, _>(fields.position),
        }
    }
}

fn bind_range_field(query: BoxedQuery, field: RangeField, range: &StorableRange) -> BoxedQuery {
    match field {
        RangeField::Sex => query.bind::<Text, _>(range.sex.clone()),
        RangeField::AgeMin => query.bind::<Nullable<Integer>, _>(range.age_min),
        RangeField::AgeMax => query.bind::<Nullable<Integer>, _>(range.age_max),
        RangeField::AgeMinUnit => query.bind::<Text, _>(range.age_min_unit.clone()),
        RangeField::Lower => query.bind::<Nullable<Double>, _>(range.lower),
        RangeField::Upper => query.bind::<Nullable<Double>, _>(range.upper),
        RangeField::TextValue => query.bind::<Nullable<Text>, _>(range.text_value.clone()),
        RangeField::Notes => query.bind::<Nullable<Text>, _>(range.notes.clone()),
        RangeField::Unit => query.bind::<Nullable<Text>, _>(range.unit.clone()),
    }
}

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|n| format!("${}", n))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct PgParameterStore<'a> {
    conn: &'a mut PgConnection,
    schema: &'a SchemaInfo,
    ranges: &'static dyn RangeTableAdapter,
}

impl<'a> PgParameterStore<'a> {
    pub fn new(conn: &'a mut PgConnection, schema: &'a SchemaInfo) -> Self {
        Self {
            conn,
            schema,
            ranges: adapter_for(schema.range_table),
        }
    }

    fn parameter_columns(&self) -> Vec<ParameterColumn> {
        ParameterColumn::ALL
            .into_iter()
            .filter(|c| self.schema.parameter_columns.contains(c.name()))
            .collect()
    }

    fn parameter_select(&self) -> String {
        let optional = |column: &str, cast: &str| {
            if self.schema.parameter_columns.contains(column) {
                format!("{}::{} AS {}", column, cast, column)
            } else {
                format!("NULL::{} AS {}", cast, column)
            }
        };
        format!(
            "id::int8 AS id, analysis_id::int8 AS analysis_id, name::text AS name, {}, {}, {}",
            optional("unit", "text"),
            optional("decimal_places", "int4"),
            optional("position", "int4"),
        )
    }
}

impl ParameterStore for PgParameterStore<'_> {
    fn lock_analysis(&mut self, analysis_id: AnalysisId) -> RepositoryResult<()> {
        sql_query("SELECT pg_advisory_xact_lock($1)")
            .bind::<BigInt, _>(analysis_id.value())
            .execute(self.conn)
            .map_err(|e| RepositoryError::from(e).with_operation("lock_analysis"))?;
        Ok(())
    }

    fn parameter_ids(&mut self, analysis_id: AnalysisId) -> RepositoryResult<Vec<ParameterId>> {
        let rows = sql_query(format!(
            "SELECT id::int8 AS id FROM {} WHERE analysis_id = $1",
            PARAMETER_TABLE
        ))
        .bind::<BigInt, _>(analysis_id.value())
        .load::<IdRow>(self.conn)?;
        Ok(rows.into_iter().map(|r| ParameterId::new(r.id)).collect())
    }

    fn parameter_exists(&mut self, parameter_id: ParameterId) -> RepositoryResult<bool> {
        let row = sql_query(format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1) AS present",
            PARAMETER_TABLE
        ))
        .bind::<BigInt, _>(parameter_id.value())
        .get_result::<ExistsRow>(self.conn)?;
        Ok(row.present)
    }

    fn delete_parameters(&mut self, ids: &[ParameterId]) -> RepositoryResult<usize> {
        let ids: Vec<i64> = ids.iter().map(|id| id.value()).collect();
        sql_query(format!(
            "DELETE FROM {} WHERE parameter_id = ANY($1)",
            self.ranges.table()
        ))
        .bind::<Array<BigInt>, _>(ids.clone())
        .execute(self.conn)?;

        let removed = sql_query(format!("DELETE FROM {} WHERE id = ANY($1)", PARAMETER_TABLE))
            .bind::<Array<BigInt>, _>(ids)
            .execute(self.conn)?;
        Ok(removed)
    }

    fn insert_parameter(
        &mut self,
        analysis_id: AnalysisId,
        fields: &ParameterFields,
    ) -> RepositoryResult<ParameterId> {
        let optional = self.parameter_columns();
        let mut columns = vec!["analysis_id", "name"];
        columns.extend(optional.iter().map(|c| c.name()));

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id::int8 AS id",
            PARAMETER_TABLE,
            columns.join(", "),
            placeholders(1, columns.len())
        );
        let mut query = sql_query(sql)
            .into_boxed::<Pg>()
            .bind::<BigInt, _>(analysis_id.value())
            .bind::<Text, _>(fields.name.clone());
        for column in optional {
            query = column.bind(query, fields);
        }

        let row = query.get_result::<IdRow>(self.conn).map_err(|e| {
            RepositoryError::from(e).with_entity("parameter", &fields.name)
        })?;
        Ok(ParameterId::new(row.id))
    }

    fn update_parameter(
        &mut self,
        parameter_id: ParameterId,
        fields: &ParameterFields,
    ) -> RepositoryResult<()> {
        let optional = self.parameter_columns();
        let mut assignments = vec!["name = $1".to_string()];
        assignments.extend(
            optional
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ${}", c.name(), i + 2)),
        );

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ${}",
            PARAMETER_TABLE,
            assignments.join(", "),
            optional.len() + 2
        );
        let mut query = sql_query(sql)
            .into_boxed::<Pg>()
            .bind::<Text, _>(fields.name.clone());
        for column in optional {
            query = column.bind(query, fields);
        }
        query
            .bind::<BigInt, _>(parameter_id.value())
            .execute(self.conn)?;
        Ok(())
    }

    fn load_parameters(&mut self, analysis_id: AnalysisId) -> RepositoryResult<Vec<Parameter>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE analysis_id = $1 ORDER BY position NULLS LAST, id",
            self.parameter_select(),
            PARAMETER_TABLE
        );
        let rows = sql_query(sql)
            .bind::<BigInt, _>(analysis_id.value())
            .load::<ParameterRow>(self.conn)?;
        Ok(rows.into_iter().map(Parameter::from).collect())
    }

    fn delete_ranges(&mut self, parameter_id: ParameterId) -> RepositoryResult<usize> {
        let removed = sql_query(format!(
            "DELETE FROM {} WHERE parameter_id = $1",
            self.ranges.table()
        ))
        .bind::<BigInt, _>(parameter_id.value())
        .execute(self.conn)?;
        Ok(removed)
    }

    fn insert_range(
        &mut self,
        parameter_id: ParameterId,
        range: &StorableRange,
    ) -> RepositoryResult<RangeId> {
        let fields = self.ranges.writable_fields(&self.schema.range_columns);
        let mut columns = vec!["parameter_id"];
        columns.extend(fields.iter().map(|(_, column)| *column));

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id::int8 AS id",
            self.ranges.table(),
            columns.join(", "),
            placeholders(1, columns.len())
        );
        let mut query = sql_query(sql)
            .into_boxed::<Pg>()
            .bind::<BigInt, _>(parameter_id.value());
        for (field, _) in fields {
            query = bind_range_field(query, field, range);
        }

        let row = query.get_result::<IdRow>(self.conn).map_err(|e| {
            RepositoryError::from(e).with_entity("parameter", parameter_id)
        })?;
        Ok(RangeId::new(row.id))
    }

    fn ranges_for_parameter(
        &mut self,
        parameter_id: ParameterId,
    ) -> RepositoryResult<Vec<UnifiedRange>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE parameter_id = $1 ORDER BY sex, age_min NULLS FIRST, id",
            self.ranges.select_list(&self.schema.range_columns),
            self.ranges.table()
        );
        let rows = sql_query(sql)
            .bind::<BigInt, _>(parameter_id.value())
            .load::<RangeRow>(self.conn)?;
        Ok(rows.into_iter().map(UnifiedRange::from).collect())
    }

    fn range_owner(&mut self, range_id: RangeId) -> RepositoryResult<Option<ParameterId>> {
        let rows = sql_query(format!(
            "SELECT parameter_id::int8 AS parameter_id FROM {} WHERE id = $1",
            self.ranges.table()
        ))
        .bind::<BigInt, _>(range_id.value())
        .load::<OwnerRow>(self.conn)?;
        Ok(rows.first().map(|r| ParameterId::new(r.parameter_id)))
    }

    fn update_range(&mut self, range_id: RangeId, range: &StorableRange) -> RepositoryResult<()> {
        let fields = self.ranges.writable_fields(&self.schema.range_columns);
        if fields.is_empty() {
            return Err(RepositoryError::query_with_context(
                "range table has no writable columns",
                ErrorContext::new("update_range").with_entity(self.ranges.table()),
            ));
        }
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (_, column))| format!("{} = ${}", column, i + 1))
            .collect();

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ${}",
            self.ranges.table(),
            assignments.join(", "),
            fields.len() + 1
        );
        let mut query = sql_query(sql).into_boxed::<Pg>();
        for (field, _) in &fields {
            query = bind_range_field(query, *field, range);
        }
        query
            .bind::<BigInt, _>(range_id.value())
            .execute(self.conn)
            .map_err(|e| RepositoryError::from(e).with_entity("reference_range", range_id))?;
        Ok(())
    }

    fn delete_range(&mut self, range_id: RangeId) -> RepositoryResult<bool> {
        let removed = sql_query(format!("DELETE FROM {} WHERE id = $1", self.ranges.table()))
            .bind::<BigInt, _>(range_id.value())
            .execute(self.conn)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_numbered_from_offset() {
        assert_eq!(placeholders(1, 3), "$1, $2, $3");
        assert_eq!(placeholders(4, 1), "$4");
    }
}
