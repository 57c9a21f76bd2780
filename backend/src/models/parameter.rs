//! Analyses, parameters and the sync request payload.

use serde::{Deserialize, Serialize};

use super::range::{RawRange, UnifiedRange};
use crate::define_id_type;

define_id_type!(i64, AnalysisId);
define_id_type!(i64, ParameterId);

/// A measured analyte within an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: ParameterId,
    pub analysis_id: AnalysisId,
    pub name: String,
    pub unit: Option<String>,
    pub decimal_places: Option<i32>,
    pub position: Option<i32>,
}

/// A parameter together with all of its stored ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedParameter {
    pub id: ParameterId,
    pub analysis_id: AnalysisId,
    pub name: String,
    pub unit: Option<String>,
    pub decimal_places: Option<i32>,
    pub position: Option<i32>,
    pub reference_ranges: Vec<UnifiedRange>,
}

impl UnifiedParameter {
    pub fn new(parameter: Parameter, reference_ranges: Vec<UnifiedRange>) -> Self {
        Self {
            id: parameter.id,
            analysis_id: parameter.analysis_id,
            name: parameter.name,
            unit: parameter.unit,
            decimal_places: parameter.decimal_places,
            position: parameter.position,
            reference_ranges,
        }
    }
}

/// Scalar fields written by a parameter upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterFields {
    /// Existing id, if the client is updating a known parameter.
    pub id: Option<ParameterId>,
    pub name: String,
    pub unit: Option<String>,
    pub position: Option<i32>,
    pub decimal_places: Option<i32>,
}

/// What to do with a parameter's stored ranges during a sync.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeDirective {
    /// Leave stored ranges untouched.
    Preserve,
    /// Delete stored ranges and write the expansion of these rows.
    /// An empty list clears the parameter.
    Replace(Vec<RawRange>),
}

impl RangeDirective {
    /// Resolve the client payload.
    ///
    /// An omitted or `null` range field, or an empty list without
    /// `clearRanges`, preserves stored ranges. A non-empty list, or
    /// `clearRanges: true`, replaces them.
    pub fn from_payload(ranges: Option<Vec<RawRange>>, clear_ranges: bool) -> Self {
        match (ranges, clear_ranges) {
            (Some(rows), _) if !rows.is_empty() => Self::Replace(rows),
            (_, true) => Self::Replace(Vec::new()),
            _ => Self::Preserve,
        }
    }
}

/// One parameter of a sync request, after payload interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub fields: ParameterFields,
    pub ranges: RangeDirective,
}

/// Wire shape of one parameter in `POST /{id}/parameters-sync`.
#[derive(Debug, Clone, Deserialize)]
pub struct ParameterInput {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(alias = "nombre")]
    pub name: String,
    #[serde(default, alias = "unidad")]
    pub unit: Option<String>,
    #[serde(default, alias = "orden")]
    pub position: Option<i32>,
    #[serde(default, alias = "decimalPlaces", alias = "decimales")]
    pub decimal_places: Option<i32>,
    #[serde(default)]
    pub reference_ranges: Option<Vec<RawRange>>,
    /// Spanish spelling of `reference_ranges`, which wins when both are sent.
    #[serde(default, rename = "valorReferencia")]
    pub valor_referencia: Option<Vec<RawRange>>,
    #[serde(default, alias = "clearRanges")]
    pub clear_ranges: bool,
}

impl ParameterInput {
    /// Convert into a spec. `index` is the parameter's place in the request
    /// and becomes its position when the client did not send one.
    pub fn into_spec(self, index: usize) -> ParameterSpec {
        let position = self.position.or(i32::try_from(index + 1).ok());
        ParameterSpec {
            fields: ParameterFields {
                id: self.id.map(ParameterId::new),
                name: self.name.trim().to_string(),
                unit: self.unit.filter(|u| !u.trim().is_empty()),
                position,
                decimal_places: self.decimal_places,
            },
            ranges: RangeDirective::from_payload(
                self.reference_ranges.or(self.valor_referencia),
                self.clear_ranges,
            ),
        }
    }
}
