//! Parameter and reference range synchronization.
//!
//! Every function here runs against a [`ParameterStore`] that wraps one open
//! transaction. A returned error means the caller must roll back; nothing in
//! this module commits.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

use super::error::{SyncError, SyncResult};
use crate::algorithms::{expand_and_validate, normalize_range};
use crate::config::settings;
use crate::db::repository::ParameterStore;
use crate::db::schema_cache::SchemaInfo;
use crate::models::{
    AnalysisId, ParameterId, ParameterSpec, RangeDirective, RangeId, RawRange, StorableRange,
    UnifiedParameter, UnifiedRange, NO_REFERENCE_NOTE,
};
use crate::services::sex_tokens::SexKind;

/// Result of a committed sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub parameters: Vec<UnifiedParameter>,
    pub inserted_ranges: usize,
}

/// Replace the parameter list of an analysis.
///
/// Parameters missing from `specs` are deleted with their ranges. Incoming
/// parameters are updated when their id belongs to the analysis and inserted
/// otherwise. Ranges follow each spec's [`RangeDirective`].
pub fn sync_parameters<S: ParameterStore + ?Sized>(
    store: &mut S,
    schema: &SchemaInfo,
    analysis_id: AnalysisId,
    specs: &[ParameterSpec],
) -> SyncResult<SyncOutcome> {
    store.lock_analysis(analysis_id)?;

    let existing: HashSet<ParameterId> = store.parameter_ids(analysis_id)?.into_iter().collect();
    let kept: HashSet<ParameterId> = specs
        .iter()
        .filter_map(|spec| spec.fields.id)
        .filter(|id| existing.contains(id))
        .collect();

    let mut stale: Vec<ParameterId> = existing.difference(&kept).copied().collect();
    stale.sort();
    if !stale.is_empty() {
        let removed = store.delete_parameters(&stale)?;
        info!(analysis_id = %analysis_id, removed, "deleted parameters absent from sync");
    }

    let mut inserted_ranges = 0;
    for spec in specs {
        let parameter_id = match spec.fields.id.filter(|id| kept.contains(id)) {
            Some(id) => {
                store.update_parameter(id, &spec.fields)?;
                id
            }
            None => store.insert_parameter(analysis_id, &spec.fields)?,
        };

        if let RangeDirective::Replace(rows) = &spec.ranges {
            inserted_ranges += replace_ranges(store, schema, parameter_id, &spec.fields.name, rows)?;
        }
    }

    let parameters = load_unified(store, schema, analysis_id)?;
    info!(
        analysis_id = %analysis_id,
        parameters = parameters.len(),
        inserted_ranges,
        "parameter sync applied"
    );

    Ok(SyncOutcome {
        parameters,
        inserted_ranges,
    })
}

/// Delete a parameter's ranges and write the expansion of `rows`.
/// Returns the number of rows written.
fn replace_ranges<S: ParameterStore + ?Sized>(
    store: &mut S,
    schema: &SchemaInfo,
    parameter_id: ParameterId,
    parameter_name: &str,
    rows: &[RawRange],
) -> SyncResult<usize> {
    store.delete_ranges(parameter_id)?;

    let expanded = expand_and_validate(rows, &schema.vocabulary)?;
    if settings().debug_sync_ranges {
        debug!(
            parameter_id = %parameter_id,
            submitted = rows.len(),
            expanded = ?expanded,
            "expanded reference ranges"
        );
    }

    let mut inserted = 0;
    for range in &expanded {
        if let Some((lower, upper)) = range.inverted_bounds() {
            return Err(SyncError::InvalidInterval {
                lower,
                upper,
                parameter: Some(parameter_name.to_string()),
            });
        }
        if is_no_reference_marker(range) {
            continue;
        }
        store.insert_range(parameter_id, &to_storage(schema, range))?;
        inserted += 1;
    }

    if !rows.is_empty() && inserted == 0 {
        let fallback = StorableRange::placeholder(
            schema.vocabulary.token(SexKind::Both),
            None,
            None,
            Some(NO_REFERENCE_NOTE),
        );
        store.insert_range(parameter_id, &to_storage(schema, &fallback))?;
        inserted += 1;
        debug!(parameter_id = %parameter_id, "inserted fallback reference placeholder");
    }

    Ok(inserted)
}

/// A row whose only content is the "no reference established" note.
fn is_no_reference_marker(range: &StorableRange) -> bool {
    !range.has_data() && range.notes.as_deref() == Some(NO_REFERENCE_NOTE)
}

fn to_storage(schema: &SchemaInfo, range: &StorableRange) -> StorableRange {
    StorableRange {
        sex: schema.vocabulary.bridge_to_legacy(&range.sex),
        ..range.clone()
    }
}

/// Stored row as seen by clients: sex mapped back to the canonical token.
fn to_canonical(schema: &SchemaInfo, mut range: UnifiedRange) -> UnifiedRange {
    range.sex = schema.vocabulary.normalize(&range.sex);
    range
}

/// Parameters of an analysis with their ranges.
pub fn load_unified<S: ParameterStore + ?Sized>(
    store: &mut S,
    schema: &SchemaInfo,
    analysis_id: AnalysisId,
) -> SyncResult<Vec<UnifiedParameter>> {
    let parameters = store.load_parameters(analysis_id)?;
    let mut unified = Vec::with_capacity(parameters.len());
    for parameter in parameters {
        let ranges = store
            .ranges_for_parameter(parameter.id)?
            .into_iter()
            .map(|r| to_canonical(schema, r))
            .collect();
        unified.push(UnifiedParameter::new(parameter, ranges));
    }
    Ok(unified)
}

pub fn list_ranges<S: ParameterStore + ?Sized>(
    store: &mut S,
    schema: &SchemaInfo,
    parameter_id: ParameterId,
) -> SyncResult<Vec<UnifiedRange>> {
    if !store.parameter_exists(parameter_id)? {
        return Err(SyncError::not_found("parameter", parameter_id));
    }
    Ok(store
        .ranges_for_parameter(parameter_id)?
        .into_iter()
        .map(|r| to_canonical(schema, r))
        .collect())
}

/// Normalize and validate one row for the single-range endpoints.
///
/// `exclude` skips the row being updated during the overlap check.
fn prepare_single<S: ParameterStore + ?Sized>(
    store: &mut S,
    schema: &SchemaInfo,
    parameter_id: ParameterId,
    raw: &RawRange,
    exclude: Option<RangeId>,
) -> SyncResult<StorableRange> {
    let range = normalize_range(raw, 0, &schema.vocabulary)?;
    if range.is_empty() {
        return Err(SyncError::Normalization {
            index: 0,
            message: "range has no bounds, text or notes".to_string(),
        });
    }
    if let Some((lower, upper)) = range.inverted_bounds() {
        return Err(SyncError::InvalidInterval {
            lower,
            upper,
            parameter: None,
        });
    }

    let sex = schema.vocabulary.classify(&range.sex);
    let span = range.span();
    let siblings = store.ranges_for_parameter(parameter_id)?;
    if let Some(existing) = siblings.iter().find(|other| {
        Some(other.id) != exclude
            && schema.vocabulary.classify(&other.sex) == sex
            && other.span().overlaps(&span)
    }) {
        return Err(SyncError::Overlap {
            sex: range.sex.clone(),
            prev: existing.span(),
            curr: span,
        });
    }

    Ok(range)
}

pub fn insert_single_range<S: ParameterStore + ?Sized>(
    store: &mut S,
    schema: &SchemaInfo,
    parameter_id: ParameterId,
    raw: &RawRange,
) -> SyncResult<UnifiedRange> {
    if !store.parameter_exists(parameter_id)? {
        return Err(SyncError::not_found("parameter", parameter_id));
    }
    let range = prepare_single(store, schema, parameter_id, raw, None)?;
    let id = store.insert_range(parameter_id, &to_storage(schema, &range))?;
    Ok(UnifiedRange::from_storable(id, &range))
}

pub fn update_single_range<S: ParameterStore + ?Sized>(
    store: &mut S,
    schema: &SchemaInfo,
    range_id: RangeId,
    raw: &RawRange,
) -> SyncResult<UnifiedRange> {
    let parameter_id = store
        .range_owner(range_id)?
        .ok_or_else(|| SyncError::not_found("reference range", range_id))?;
    let range = prepare_single(store, schema, parameter_id, raw, Some(range_id))?;
    store.update_range(range_id, &to_storage(schema, &range))?;
    Ok(UnifiedRange::from_storable(range_id, &range))
}

pub fn delete_single_range<S: ParameterStore + ?Sized>(
    store: &mut S,
    range_id: RangeId,
) -> SyncResult<()> {
    if store.delete_range(range_id)? {
        Ok(())
    } else {
        Err(SyncError::not_found("reference range", range_id))
    }
}
