//! Row types for the hand-built SQL in this backend.
//!
//! Column lists differ between tenants, so every query is assembled at runtime
//! and read back with `QueryableByName` under fixed aliases.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Double, Integer, Nullable, Text};

use crate::models::{AnalysisId, Parameter, ParameterId, RangeId, UnifiedRange};

#[derive(Debug, Clone, QueryableByName)]
pub struct ParameterRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub analysis_id: i64,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub unit: Option<String>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub decimal_places: Option<i32>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub position: Option<i32>,
}

impl From<ParameterRow> for Parameter {
    fn from(row: ParameterRow) -> Self {
        Self {
            id: ParameterId::new(row.id),
            analysis_id: AnalysisId::new(row.analysis_id),
            name: row.name,
            unit: row.unit,
            decimal_places: row.decimal_places,
            position: row.position,
        }
    }
}

#[derive(Debug, Clone, QueryableByName)]
pub struct RangeRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Nullable<Text>)]
    pub sex: Option<String>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub age_min: Option<i32>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub age_max: Option<i32>,
    #[diesel(sql_type = Nullable<Text>)]
    pub age_min_unit: Option<String>,
    #[diesel(sql_type = Nullable<Double>)]
    pub lower: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    pub upper: Option<f64>,
    #[diesel(sql_type = Nullable<Text>)]
    pub text_value: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub notes: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub unit: Option<String>,
}

impl From<RangeRow> for UnifiedRange {
    fn from(row: RangeRow) -> Self {
        Self {
            id: RangeId::new(row.id),
            sex: row.sex.unwrap_or_default(),
            age_min: row.age_min,
            age_max: row.age_max,
            age_min_unit: row.age_min_unit,
            lower: row.lower,
            upper: row.upper,
            text_value: row.text_value,
            notes: row.notes,
            unit: row.unit,
        }
    }
}

#[derive(Debug, Clone, QueryableByName)]
pub struct IdRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
}

#[derive(Debug, Clone, QueryableByName)]
pub struct OwnerRow {
    #[diesel(sql_type = BigInt)]
    pub parameter_id: i64,
}

#[derive(Debug, Clone, QueryableByName)]
pub struct ExistsRow {
    #[diesel(sql_type = Bool)]
    pub present: bool,
}

#[derive(Debug, Clone, QueryableByName)]
pub struct ColumnNameRow {
    #[diesel(sql_type = Text)]
    pub column_name: String,
}

#[derive(Debug, Clone, QueryableByName)]
pub struct ConstraintDefinitionRow {
    #[diesel(sql_type = Text)]
    pub definition: String,
}
