//! Reference range value types.
//!
//! A range travels through three shapes:
//!
//! - [`RawRange`]: whatever JSON object the client submitted, with any of the
//!   historical key spellings still in place.
//! - [`StorableRange`]: the normalized row produced by the interval engine and
//!   written to storage.
//! - [`UnifiedRange`]: the stored row as returned by the API, identical in shape
//!   for modern and legacy range tables.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::define_id_type;

define_id_type!(i64, RangeId);

/// Lower edge of the covered lifespan, in years.
pub const LIFESPAN_MIN_AGE: i32 = 0;
/// Upper edge of the covered lifespan, in years.
pub const LIFESPAN_MAX_AGE: i32 = 120;
/// Age unit written when the client does not send one.
pub const DEFAULT_AGE_UNIT: &str = "years";
/// Notes attached to rows synthesized to close coverage gaps.
pub const AUTO_FILL_NOTE: &str = "Auto-fill gap";
/// Notes marking a row that only states that no reference exists.
pub const NO_REFERENCE_NOTE: &str = "Sin referencia establecida";

/// Client-submitted range row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRange(pub Value);

impl RawRange {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }
}

impl From<Value> for RawRange {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Inclusive age span in years. A `None` bound is open and clamps to the
/// lifespan edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgeSpan {
    pub age_min: Option<i32>,
    pub age_max: Option<i32>,
}

impl AgeSpan {
    pub fn new(age_min: Option<i32>, age_max: Option<i32>) -> Self {
        Self { age_min, age_max }
    }

    /// Clamped start (`None` → 0).
    pub fn start(&self) -> i32 {
        self.age_min.unwrap_or(LIFESPAN_MIN_AGE)
    }

    /// Clamped end (`None` → 120).
    pub fn end(&self) -> i32 {
        self.age_max.unwrap_or(LIFESPAN_MAX_AGE)
    }

    /// Both bounds absent: the span covers the whole lifespan.
    pub fn is_whole_life(&self) -> bool {
        self.age_min.is_none() && self.age_max.is_none()
    }

    /// True overlap. Spans sharing only an endpoint (`a.end == b.start`) are
    /// adjacent, not overlapping.
    pub fn overlaps(&self, other: &AgeSpan) -> bool {
        self.start() < other.end() && other.start() < self.end()
    }
}

impl fmt::Display for AgeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start(), self.end())
    }
}

/// Normalized range row, ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorableRange {
    pub sex: String,
    pub age_min: Option<i32>,
    pub age_max: Option<i32>,
    pub age_min_unit: String,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub text_value: Option<String>,
    pub notes: Option<String>,
    pub unit: Option<String>,
}

impl StorableRange {
    /// A row without bounds or text.
    pub fn placeholder(
        sex: impl Into<String>,
        age_min: Option<i32>,
        age_max: Option<i32>,
        notes: Option<&str>,
    ) -> Self {
        Self {
            sex: sex.into(),
            age_min,
            age_max,
            age_min_unit: DEFAULT_AGE_UNIT.to_string(),
            lower: None,
            upper: None,
            text_value: None,
            notes: notes.map(str::to_string),
            unit: None,
        }
    }

    pub fn span(&self) -> AgeSpan {
        AgeSpan::new(self.age_min, self.age_max)
    }

    /// Carries a numeric bound or a qualitative text value.
    pub fn has_data(&self) -> bool {
        self.lower.is_some() || self.upper.is_some() || self.text_value.is_some()
    }

    /// Carries nothing at all, not even notes.
    pub fn is_empty(&self) -> bool {
        !self.has_data() && self.notes.is_none()
    }

    /// Returns `(lower, upper)` when both bounds are present and inverted.
    pub fn inverted_bounds(&self) -> Option<(f64, f64)> {
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) if lower > upper => Some((lower, upper)),
            _ => None,
        }
    }
}

/// Stored range as exposed by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRange {
    pub id: RangeId,
    pub sex: String,
    pub age_min: Option<i32>,
    pub age_max: Option<i32>,
    pub age_min_unit: Option<String>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub text_value: Option<String>,
    pub notes: Option<String>,
    pub unit: Option<String>,
}

impl UnifiedRange {
    pub fn from_storable(id: RangeId, range: &StorableRange) -> Self {
        Self {
            id,
            sex: range.sex.clone(),
            age_min: range.age_min,
            age_max: range.age_max,
            age_min_unit: Some(range.age_min_unit.clone()),
            lower: range.lower,
            upper: range.upper,
            text_value: range.text_value.clone(),
            notes: range.notes.clone(),
            unit: range.unit.clone(),
        }
    }

    pub fn span(&self) -> AgeSpan {
        AgeSpan::new(self.age_min, self.age_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_clamps_open_bounds() {
        let span = AgeSpan::new(None, Some(17));
        assert_eq!(span.start(), 0);
        assert_eq!(span.end(), 17);
        assert!(AgeSpan::new(None, None).is_whole_life());
    }

    #[test]
    fn test_adjacent_spans_do_not_overlap() {
        let a = AgeSpan::new(Some(0), Some(17));
        let b = AgeSpan::new(Some(17), Some(30));
        let c = AgeSpan::new(Some(10), Some(30));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn test_placeholder_has_no_data() {
        let row = StorableRange::placeholder("Ambos", Some(0), Some(17), Some(AUTO_FILL_NOTE));
        assert!(!row.has_data());
        assert!(!row.is_empty());
        assert!(StorableRange::placeholder("Ambos", None, None, None).is_empty());
    }

    #[test]
    fn test_inverted_bounds() {
        let mut row = StorableRange::placeholder("Ambos", None, None, None);
        row.lower = Some(5.0);
        row.upper = Some(2.0);
        assert_eq!(row.inverted_bounds(), Some((5.0, 2.0)));
        row.upper = Some(5.0);
        assert_eq!(row.inverted_bounds(), None);
    }
}
