//! Column mapping for the two generations of range table.
//!
//! The engine only knows [`RangeField`]s. An adapter names the physical
//! column behind each field, and SQL is generated only for the columns the
//! tenant's table actually has.

use crate::db::schema_cache::{ColumnSet, RangeTableKind, LEGACY_RANGE_TABLE, MODERN_RANGE_TABLE};

/// Logical range attributes, in select order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeField {
    Sex,
    AgeMin,
    AgeMax,
    AgeMinUnit,
    Lower,
    Upper,
    TextValue,
    Notes,
    Unit,
}

impl RangeField {
    pub const ALL: [RangeField; 9] = [
        RangeField::Sex,
        RangeField::AgeMin,
        RangeField::AgeMax,
        RangeField::AgeMinUnit,
        RangeField::Lower,
        RangeField::Upper,
        RangeField::TextValue,
        RangeField::Notes,
        RangeField::Unit,
    ];

    /// Alias used in SELECT lists; matches the `RangeRow` field names.
    pub fn alias(self) -> &'static str {
        match self {
            Self::Sex => "sex",
            Self::AgeMin => "age_min",
            Self::AgeMax => "age_max",
            Self::AgeMinUnit => "age_min_unit",
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::TextValue => "text_value",
            Self::Notes => "notes",
            Self::Unit => "unit",
        }
    }

    /// Cast applied on read so legacy `numeric`/`varchar` columns decode
    /// into the row types.
    pub fn sql_cast(self) -> &'static str {
        match self {
            Self::AgeMin | Self::AgeMax => "int4",
            Self::Lower | Self::Upper => "float8",
            _ => "text",
        }
    }
}

pub trait RangeTableAdapter: Send + Sync {
    fn table(&self) -> &'static str;

    /// Physical column for a logical field.
    fn column(&self, field: RangeField) -> &'static str;

    /// Fields whose column exists on this tenant's table, with the column name.
    fn writable_fields(&self, columns: &ColumnSet) -> Vec<(RangeField, &'static str)> {
        RangeField::ALL
            .into_iter()
            .map(|field| (field, self.column(field)))
            .filter(|(_, column)| columns.contains(column))
            .collect()
    }

    /// `id` plus every field under its alias. Missing columns read as NULL.
    fn select_list(&self, columns: &ColumnSet) -> String {
        let mut items = vec!["id::int8 AS id".to_string()];
        for field in RangeField::ALL {
            let column = self.column(field);
            let source = if columns.contains(column) {
                column
            } else {
                "NULL"
            };
            items.push(format!("{}::{} AS {}", source, field.sql_cast(), field.alias()));
        }
        items.join(", ")
    }
}

/// `analysis_reference_ranges`, created by the current migrations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModernRangeTable;

impl RangeTableAdapter for ModernRangeTable {
    fn table(&self) -> &'static str {
        MODERN_RANGE_TABLE
    }

    fn column(&self, field: RangeField) -> &'static str {
        field.alias()
    }
}

/// `reference_ranges`, with Spanish column names.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyRangeTable;

impl RangeTableAdapter for LegacyRangeTable {
    fn table(&self) -> &'static str {
        LEGACY_RANGE_TABLE
    }

    fn column(&self, field: RangeField) -> &'static str {
        match field {
            RangeField::Sex => "sexo",
            RangeField::AgeMin => "edad_min",
            RangeField::AgeMax => "edad_max",
            RangeField::AgeMinUnit => "unidad_edad",
            RangeField::Lower => "valor_min",
            RangeField::Upper => "valor_max",
            RangeField::TextValue => "valor_texto",
            RangeField::Notes => "notas",
            RangeField::Unit => "unidad",
        }
    }
}

static MODERN: ModernRangeTable = ModernRangeTable;
static LEGACY: LegacyRangeTable = LegacyRangeTable;

/// Adapter for the table generation recorded in a schema snapshot.
pub fn adapter_for(kind: RangeTableKind) -> &'static dyn RangeTableAdapter {
    match kind {
        RangeTableKind::Modern => &MODERN,
        RangeTableKind::Legacy => &LEGACY,
    }
}
