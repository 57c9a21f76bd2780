//! Reference interval expansion and validation.
//!
//! Turns a client-submitted list of age/value ranges into a partition of the
//! lifespan `[0, 120]` per sex group:
//!
//! 1. resolve key aliases, coerce numbers, normalize sex, drop empty rows;
//!    ages outside `[0, 120]` are rejected
//! 2. group by sex token
//! 3. a whole-life row (both ages null) replaces its whole group
//! 4. collapse rows with identical spans, preferring the one carrying data
//! 5. sort by clamped `(start, end)`
//! 6. resolve same-start and contained placeholder rows
//! 7. reject genuine overlaps
//! 8. fill gaps with placeholder rows noted `"Auto-fill gap"`
//!
//! Adjacent spans that share an endpoint (`curr.age_min == prev.age_max`) are
//! accepted. Value bounds are not compared here; `lower <= upper` is enforced
//! when rows are written.

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{
    AgeSpan, RawRange, StorableRange, AUTO_FILL_NOTE, DEFAULT_AGE_UNIT, LIFESPAN_MAX_AGE,
    LIFESPAN_MIN_AGE,
};
use crate::services::sex_tokens::SexVocabulary;

const SEX_KEYS: &[&str] = &["sex", "sexo", "gender", "genero", "género"];
const AGE_MIN_KEYS: &[&str] = &[
    "age_min",
    "edad_min",
    "min_age",
    "ageMin",
    "edadMin",
    "edad_minima",
    "age_from",
];
const AGE_MAX_KEYS: &[&str] = &[
    "age_max",
    "edad_max",
    "max_age",
    "ageMax",
    "edadMax",
    "edad_maxima",
    "age_to",
];
const AGE_UNIT_KEYS: &[&str] = &[
    "age_min_unit",
    "age_unit",
    "unidad_edad",
    "ageUnit",
    "edad_unidad",
];
const LOWER_KEYS: &[&str] = &[
    "lower",
    "valor_min",
    "min_value",
    "lower_bound",
    "valorMin",
    "normal_min",
    "min",
];
const UPPER_KEYS: &[&str] = &[
    "upper",
    "valor_max",
    "max_value",
    "upper_bound",
    "valorMax",
    "normal_max",
    "max",
];
const TEXT_KEYS: &[&str] = &[
    "text_value",
    "texto",
    "valor_texto",
    "textValue",
    "text",
    "valor_referencia_texto",
];
const NOTES_KEYS: &[&str] = &["notes", "notas", "nota", "note", "observaciones"];
const UNIT_KEYS: &[&str] = &["unit", "unidad", "unidades", "unit_override"];

/// Errors raised by the interval engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntervalError {
    /// Two rows of the same sex group genuinely overlap.
    #[error("reference ranges overlap for sex '{sex}': {prev} and {curr}")]
    Overlap {
        sex: String,
        prev: AgeSpan,
        curr: AgeSpan,
    },

    /// A row could not be interpreted.
    #[error("range #{index}: {message}")]
    Normalization { index: usize, message: String },
}

pub type IntervalResult<T> = Result<T, IntervalError>;

fn normalization(index: usize, message: impl Into<String>) -> IntervalError {
    IntervalError::Normalization {
        index,
        message: message.into(),
    }
}

/// First non-null value among the alias keys.
fn pick<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

fn coerce_number(value: &Value) -> Result<Option<f64>, String> {
    let number = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{} is not representable", n))?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .replace(',', ".")
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not numeric", trimmed))?
        }
        other => return Err(format!("{} is not numeric", other)),
    };

    if number.is_finite() {
        Ok(Some(number))
    } else {
        Err(format!("{} is not a finite number", number))
    }
}

fn coerce_age(value: &Value) -> Result<Option<i32>, String> {
    match coerce_number(value)? {
        None => Ok(None),
        Some(age) if age < 0.0 => Err(format!("negative age {}", age)),
        Some(age) if age.trunc() > f64::from(LIFESPAN_MAX_AGE) => Err(format!(
            "age {} is beyond the lifespan limit of {}",
            age, LIFESPAN_MAX_AGE
        )),
        Some(age) => Ok(Some(age.trunc() as i32)),
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    pick(object, keys).and_then(coerce_text)
}

/// Normalize one raw row: alias resolution, numeric coercion and sex
/// normalization. Does not drop empty rows.
pub fn normalize_range(
    raw: &RawRange,
    index: usize,
    vocabulary: &SexVocabulary,
) -> IntervalResult<StorableRange> {
    let object = raw
        .as_object()
        .ok_or_else(|| normalization(index, "range must be a JSON object"))?;

    let age_min = pick(object, AGE_MIN_KEYS)
        .map(coerce_age)
        .transpose()
        .map_err(|m| normalization(index, format!("age_min: {}", m)))?
        .flatten();
    let age_max = pick(object, AGE_MAX_KEYS)
        .map(coerce_age)
        .transpose()
        .map_err(|m| normalization(index, format!("age_max: {}", m)))?
        .flatten();

    if let (Some(min), Some(max)) = (age_min, age_max) {
        if min > max {
            return Err(normalization(
                index,
                format!("age_min {} is greater than age_max {}", min, max),
            ));
        }
    }

    let lower = pick(object, LOWER_KEYS)
        .map(coerce_number)
        .transpose()
        .map_err(|m| normalization(index, format!("lower: {}", m)))?
        .flatten();
    let upper = pick(object, UPPER_KEYS)
        .map(coerce_number)
        .transpose()
        .map_err(|m| normalization(index, format!("upper: {}", m)))?
        .flatten();

    let sex = text_field(object, SEX_KEYS).unwrap_or_default();

    Ok(StorableRange {
        sex: vocabulary.normalize(&sex),
        age_min,
        age_max,
        age_min_unit: text_field(object, AGE_UNIT_KEYS)
            .unwrap_or_else(|| DEFAULT_AGE_UNIT.to_string()),
        lower,
        upper,
        text_value: text_field(object, TEXT_KEYS),
        notes: text_field(object, NOTES_KEYS),
        unit: text_field(object, UNIT_KEYS),
    })
}

/// Expand raw rows into a gap-free, non-overlapping set per sex group.
///
/// Returns an empty list for empty input. Groups keep the order in which
/// their sex first appears.
pub fn expand_and_validate(
    raw: &[RawRange],
    vocabulary: &SexVocabulary,
) -> IntervalResult<Vec<StorableRange>> {
    let mut rows = Vec::with_capacity(raw.len());
    for (index, item) in raw.iter().enumerate() {
        let row = normalize_range(item, index, vocabulary)?;
        if !row.is_empty() {
            rows.push(row);
        }
    }

    let mut expanded = Vec::with_capacity(rows.len() + 2);
    for (sex, group) in group_by_sex(rows) {
        expanded.extend(expand_group(&sex, group)?);
    }
    Ok(expanded)
}

fn group_by_sex(rows: Vec<StorableRange>) -> Vec<(String, Vec<StorableRange>)> {
    let mut groups: Vec<(String, Vec<StorableRange>)> = Vec::new();
    for row in rows {
        match groups.iter_mut().find(|(sex, _)| *sex == row.sex) {
            Some((_, members)) => members.push(row),
            None => groups.push((row.sex.clone(), vec![row])),
        }
    }
    groups
}

fn expand_group(sex: &str, rows: Vec<StorableRange>) -> IntervalResult<Vec<StorableRange>> {
    if let Some(whole_life) = rows.iter().find(|r| r.span().is_whole_life()) {
        return Ok(vec![whole_life.clone()]);
    }

    let mut rows = dedup_identical_spans(rows);
    rows.sort_by_key(|r| (r.span().start(), r.span().end()));

    let rows = merge_contained(rows);
    detect_overlap(sex, &rows)?;
    Ok(fill_gaps(sex, rows))
}

fn dedup_identical_spans(rows: Vec<StorableRange>) -> Vec<StorableRange> {
    let mut kept: Vec<StorableRange> = Vec::with_capacity(rows.len());
    let mut by_span: HashMap<(i32, i32), usize> = HashMap::new();

    for row in rows {
        let span = row.span();
        let key = (span.start(), span.end());
        match by_span.get(&key) {
            Some(&slot) => {
                if row.has_data() && !kept[slot].has_data() {
                    kept[slot] = row;
                }
            }
            None => {
                by_span.insert(key, kept.len());
                kept.push(row);
            }
        }
    }
    kept
}

/// Single left-to-right pass over sorted rows.
fn merge_contained(rows: Vec<StorableRange>) -> Vec<StorableRange> {
    let mut merged: Vec<StorableRange> = Vec::with_capacity(rows.len());

    for row in rows {
        if let Some(prev) = merged.last_mut() {
            let (prev_span, span) = (prev.span(), row.span());

            if span.start() == prev_span.start() && span.end() > prev_span.end() {
                match (prev.has_data(), row.has_data()) {
                    // Wider data row replaces a placeholder; a wider
                    // placeholder replaces a narrower one.
                    (false, _) => {
                        *prev = row;
                        continue;
                    }
                    (true, false) => continue,
                    (true, true) => {}
                }
            } else if !row.has_data()
                && span.start() >= prev_span.start()
                && span.end() <= prev_span.end()
            {
                continue;
            }
        }
        merged.push(row);
    }
    merged
}

fn detect_overlap(sex: &str, rows: &[StorableRange]) -> IntervalResult<()> {
    for pair in rows.windows(2) {
        let (prev, curr) = (pair[0].span(), pair[1].span());
        if curr.start() < prev.end() {
            return Err(IntervalError::Overlap {
                sex: sex.to_string(),
                prev,
                curr,
            });
        }
    }
    Ok(())
}

fn fill_gaps(sex: &str, rows: Vec<StorableRange>) -> Vec<StorableRange> {
    let mut filled = Vec::with_capacity(rows.len() + 2);
    let mut cursor = LIFESPAN_MIN_AGE;

    for row in rows {
        let span = row.span();
        if span.start() > cursor {
            filled.push(gap_row(sex, cursor, span.start() - 1));
        }
        cursor = cursor.max(span.end().saturating_add(1));
        filled.push(row);
    }

    if cursor <= LIFESPAN_MAX_AGE {
        filled.push(gap_row(sex, cursor, LIFESPAN_MAX_AGE));
    }
    filled
}

fn gap_row(sex: &str, age_min: i32, age_max: i32) -> StorableRange {
    StorableRange::placeholder(sex, Some(age_min), Some(age_max), Some(AUTO_FILL_NOTE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(rows: Vec<Value>) -> Vec<RawRange> {
        rows.into_iter().map(RawRange::new).collect()
    }

    fn spans(rows: &[StorableRange]) -> Vec<(Option<i32>, Option<i32>)> {
        rows.iter().map(|r| (r.age_min, r.age_max)).collect()
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        let out = expand_and_validate(&[], &SexVocabulary::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_gap_fill_around_single_row() {
        let input = raw(vec![json!({
            "sex": "Ambos", "age_min": 18, "age_max": 65, "lower": 10, "upper": 20
        })]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();

        assert_eq!(
            spans(&out),
            vec![(Some(0), Some(17)), (Some(18), Some(65)), (Some(66), Some(120))]
        );
        assert_eq!(out[0].notes.as_deref(), Some(AUTO_FILL_NOTE));
        assert_eq!(out[1].lower, Some(10.0));
        assert_eq!(out[2].notes.as_deref(), Some(AUTO_FILL_NOTE));
        assert!(out.iter().all(|r| r.sex == "Ambos"));
    }

    #[test]
    fn test_overlap_is_rejected_with_both_spans() {
        let input = raw(vec![
            json!({ "sex": "F", "age_min": 0, "age_max": 17, "lower": 1, "upper": 2 }),
            json!({ "sex": "F", "age_min": 10, "age_max": 30, "lower": 3, "upper": 4 }),
        ]);
        let err = expand_and_validate(&input, &SexVocabulary::default()).unwrap_err();

        assert_eq!(
            err,
            IntervalError::Overlap {
                sex: "Femenino".to_string(),
                prev: AgeSpan::new(Some(0), Some(17)),
                curr: AgeSpan::new(Some(10), Some(30)),
            }
        );
    }

    #[test]
    fn test_data_row_replaces_narrower_placeholder_with_same_start() {
        let input = raw(vec![
            json!({ "sex": "M", "age_min": 0, "age_max": 1, "notes": "placeholder" }),
            json!({ "sex": "M", "age_min": 0, "age_max": 17, "lower": 5, "upper": 10 }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();

        assert_eq!(spans(&out), vec![(Some(0), Some(17)), (Some(18), Some(120))]);
        assert_eq!(out[0].lower, Some(5.0));
    }

    #[test]
    fn test_contained_placeholder_is_dropped() {
        let input = raw(vec![
            json!({ "age_min": 0, "age_max": 50, "lower": 1, "upper": 2 }),
            json!({ "age_min": 10, "age_max": 20, "notes": "nothing here" }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(spans(&out), vec![(Some(0), Some(50)), (Some(51), Some(120))]);
    }

    #[test]
    fn test_wider_placeholder_wins_between_placeholders() {
        let input = raw(vec![
            json!({ "age_min": 0, "age_max": 5, "notes": "a" }),
            json!({ "age_min": 0, "age_max": 9, "notes": "b" }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(out[0].notes.as_deref(), Some("b"));
        assert_eq!(spans(&out), vec![(Some(0), Some(9)), (Some(10), Some(120))]);
    }

    #[test]
    fn test_data_row_keeps_priority_over_wider_placeholder() {
        let input = raw(vec![
            json!({ "age_min": 0, "age_max": 9, "lower": 1, "upper": 2 }),
            json!({ "age_min": 0, "age_max": 30, "notes": "wide" }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(spans(&out), vec![(Some(0), Some(9)), (Some(10), Some(120))]);
        assert_eq!(out[0].lower, Some(1.0));
    }

    #[test]
    fn test_identical_spans_prefer_data_row() {
        let input = raw(vec![
            json!({ "age_min": 0, "age_max": 120, "notes": "empty" }),
            json!({ "age_min": 0, "age_max": 120, "text_value": "Negativo" }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text_value.as_deref(), Some("Negativo"));
    }

    #[test]
    fn test_identical_spans_with_data_keep_first() {
        let input = raw(vec![
            json!({ "age_min": 0, "age_max": 120, "lower": 1, "upper": 2 }),
            json!({ "age_min": 0, "age_max": 120, "lower": 3, "upper": 4 }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].lower, Some(1.0));
    }

    #[test]
    fn test_whole_life_row_is_the_only_row_for_its_group() {
        let input = raw(vec![
            json!({ "sex": "Ambos", "age_min": 0, "age_max": 10, "lower": 1, "upper": 2 }),
            json!({ "sex": "Ambos", "lower": 5, "upper": 6 }),
            json!({ "sex": "Ambos", "lower": 7, "upper": 8 }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].lower, Some(5.0));
        assert!(out[0].span().is_whole_life());
    }

    #[test]
    fn test_adjacent_rows_sharing_an_endpoint_are_accepted() {
        let input = raw(vec![
            json!({ "age_min": 0, "age_max": 17, "lower": 1, "upper": 2 }),
            json!({ "age_min": 17, "age_max": 120, "lower": 3, "upper": 4 }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(spans(&out), vec![(Some(0), Some(17)), (Some(17), Some(120))]);
    }

    #[test]
    fn test_groups_are_expanded_independently() {
        let input = raw(vec![
            json!({ "sexo": "Masculino", "edad_min": 0, "edad_max": 60, "valor_min": 13, "valor_max": 17 }),
            json!({ "sexo": "Femenino", "edad_min": 0, "edad_max": 120, "valor_min": 12, "valor_max": 15 }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();

        let male: Vec<_> = out.iter().filter(|r| r.sex == "Masculino").collect();
        let female: Vec<_> = out.iter().filter(|r| r.sex == "Femenino").collect();
        assert_eq!(male.len(), 2);
        assert_eq!(female.len(), 1);
        assert_eq!(male[1].age_min, Some(61));
    }

    #[test]
    fn test_empty_rows_are_dropped() {
        let input = raw(vec![
            json!({ "sex": "Ambos", "age_min": 0, "age_max": 10 }),
            json!({ "sex": "Ambos", "age_min": 0, "age_max": 10, "lower": "", "texto": "  " }),
        ]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_alias_resolution_and_numeric_coercion() {
        let row = RawRange::new(json!({
            "sexo": "mujer",
            "edad_min": "2",
            "edad_max": 12.0,
            "valor_min": "3,5",
            "valor_max": " 7.25 ",
            "unidad_edad": "meses",
            "notas": "ayuno",
            "unidad": "mg/dL"
        }));
        let out = normalize_range(&row, 0, &SexVocabulary::default()).unwrap();

        assert_eq!(out.sex, "Femenino");
        assert_eq!(out.age_min, Some(2));
        assert_eq!(out.age_max, Some(12));
        assert_eq!(out.lower, Some(3.5));
        assert_eq!(out.upper, Some(7.25));
        assert_eq!(out.age_min_unit, "meses");
        assert_eq!(out.notes.as_deref(), Some("ayuno"));
        assert_eq!(out.unit.as_deref(), Some("mg/dL"));
    }

    #[test]
    fn test_non_numeric_bound_is_a_normalization_error() {
        let input = raw(vec![json!({ "age_min": 0, "age_max": 10, "lower": "abc" })]);
        let err = expand_and_validate(&input, &SexVocabulary::default()).unwrap_err();
        assert!(matches!(err, IntervalError::Normalization { index: 0, .. }));
    }

    #[test]
    fn test_inverted_age_span_is_a_normalization_error() {
        let input = raw(vec![json!({ "age_min": 40, "age_max": 10, "lower": 1 })]);
        let err = expand_and_validate(&input, &SexVocabulary::default()).unwrap_err();
        assert!(err.to_string().contains("greater than age_max"));
    }

    #[test]
    fn test_age_beyond_lifespan_is_a_normalization_error() {
        let input = raw(vec![json!({
            "sex": "Ambos", "age_min": 130, "age_max": 140, "lower": 1, "upper": 2
        })]);
        let err = expand_and_validate(&input, &SexVocabulary::default()).unwrap_err();
        assert!(matches!(err, IntervalError::Normalization { index: 0, .. }));
        assert!(err.to_string().contains("age_min"));

        let input = raw(vec![json!({ "age_min": 100, "age_max": 121, "lower": 1 })]);
        assert!(expand_and_validate(&input, &SexVocabulary::default()).is_err());
    }

    #[test]
    fn test_lifespan_edge_ages_are_accepted() {
        let input = raw(vec![json!({ "age_min": 100, "age_max": "120,9", "lower": 1 })]);
        let out = expand_and_validate(&input, &SexVocabulary::default()).unwrap();
        assert_eq!(spans(&out), vec![(Some(0), Some(99)), (Some(100), Some(120))]);
        assert!(out.iter().all(|r| r.span().end() <= LIFESPAN_MAX_AGE));
    }

    #[test]
    fn test_non_object_row_is_a_normalization_error() {
        let input = raw(vec![json!("0-10")]);
        assert!(expand_and_validate(&input, &SexVocabulary::default()).is_err());
    }

    #[test]
    fn test_output_is_a_fixed_point() {
        let input = raw(vec![
            json!({ "sex": "M", "age_min": 5, "age_max": 17, "lower": 1, "upper": 2 }),
            json!({ "sex": "F", "age_min": 30, "age_max": 40, "text_value": "Negativo" }),
        ]);
        let vocab = SexVocabulary::default();
        let first = expand_and_validate(&input, &vocab).unwrap();
        let again: Vec<RawRange> = first
            .iter()
            .map(|r| RawRange::new(serde_json::to_value(r).unwrap()))
            .collect();
        let second = expand_and_validate(&again, &vocab).unwrap();
        assert_eq!(first, second);
    }
}
