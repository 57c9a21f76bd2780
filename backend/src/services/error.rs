//! Domain errors raised while syncing parameters and reference ranges.
//!
//! Each variant carries a stable error code that clients match on.

use serde_json::{json, Value};

use crate::algorithms::IntervalError;
use crate::db::repository::{ConstraintKind, RepositoryError, Retryable};
use crate::models::AgeSpan;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("reference ranges overlap for sex '{sex}': {prev} and {curr}")]
    Overlap {
        sex: String,
        prev: AgeSpan,
        curr: AgeSpan,
    },

    #[error("lower bound {lower} is greater than upper bound {upper}{}", parameter_suffix(.parameter))]
    InvalidInterval {
        lower: f64,
        upper: f64,
        parameter: Option<String>,
    },

    #[error("reference range #{index} could not be normalized: {message}")]
    Normalization { index: usize, message: String },

    /// The live CHECK constraint rejected a sex token.
    #[error("reference range rejected by constraint: {message}")]
    ConstraintFail {
        message: String,
        allowed_tokens: Vec<String>,
        constraint_definitions: Vec<String>,
    },

    #[error("duplicate reference range: {message}")]
    Duplicate { message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("parameter sync failed: {0}")]
    Repository(RepositoryError),
}

fn parameter_suffix(parameter: &Option<String>) -> String {
    parameter
        .as_ref()
        .map(|name| format!(" (parameter '{}')", name))
        .unwrap_or_default()
}

impl SyncError {
    pub fn not_found(entity: &'static str, id: impl Into<i64>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable error code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Overlap { .. } => "REFERENCE_RANGE_OVERLAP",
            Self::InvalidInterval { .. } => "INVALID_RANGE_INTERVAL",
            Self::Normalization { .. } => "REFERENCE_RANGE_NORMALIZATION_FAIL",
            Self::ConstraintFail { .. } => "REFERENCE_RANGE_CONSTRAINT_FAIL",
            Self::Duplicate { .. } => "DUPLICATE_REFERENCE_RANGE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Repository(_) => "ANALYSIS_PARAM_SYNC_FAIL",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Overlap { .. }
            | Self::InvalidInterval { .. }
            | Self::Normalization { .. }
            | Self::ConstraintFail { .. } => 400,
            Self::Duplicate { .. } => 409,
            Self::NotFound { .. } => 404,
            Self::Repository(_) => 500,
        }
    }

    /// Structured payload returned next to the message.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Overlap { sex, prev, curr } => Some(json!({
                "sex": sex,
                "previous": { "age_min": prev.start(), "age_max": prev.end() },
                "current": { "age_min": curr.start(), "age_max": curr.end() },
            })),
            Self::InvalidInterval {
                lower,
                upper,
                parameter,
            } => Some(json!({ "lower": lower, "upper": upper, "parameter": parameter })),
            Self::Normalization { index, .. } => Some(json!({ "index": index })),
            Self::ConstraintFail {
                allowed_tokens,
                constraint_definitions,
                ..
            } => Some(json!({
                "allowedTokens": allowed_tokens,
                "constraints": constraint_definitions,
            })),
            _ => None,
        }
    }

    pub fn is_constraint_fail(&self) -> bool {
        matches!(self, Self::ConstraintFail { .. })
    }

    /// Attach a fresh snapshot of what the live constraint allows.
    pub fn with_constraint_snapshot(
        self,
        allowed_tokens: Vec<String>,
        constraint_definitions: Vec<String>,
    ) -> Self {
        match self {
            Self::ConstraintFail { message, .. } => Self::ConstraintFail {
                message,
                allowed_tokens,
                constraint_definitions,
            },
            other => other,
        }
    }
}

impl From<IntervalError> for SyncError {
    fn from(err: IntervalError) -> Self {
        match err {
            IntervalError::Overlap { sex, prev, curr } => Self::Overlap { sex, prev, curr },
            IntervalError::Normalization { index, message } => {
                Self::Normalization { index, message }
            }
        }
    }
}

impl From<RepositoryError> for SyncError {
    fn from(err: RepositoryError) -> Self {
        match err.constraint_kind() {
            Some(ConstraintKind::Check) => Self::ConstraintFail {
                message: err.message().to_string(),
                allowed_tokens: Vec::new(),
                constraint_definitions: Vec::new(),
            },
            Some(ConstraintKind::Unique) => Self::Duplicate {
                message: err.message().to_string(),
            },
            _ => Self::Repository(err),
        }
    }
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Repository(err) if err.is_retryable())
    }
}

#[cfg(feature = "postgres-repo")]
impl From<diesel::result::Error> for SyncError {
    fn from(err: diesel::result::Error) -> Self {
        RepositoryError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_violation_maps_to_constraint_fail() {
        let err: SyncError =
            RepositoryError::constraint(ConstraintKind::Check, "violates sex_check").into();
        assert_eq!(err.code(), "REFERENCE_RANGE_CONSTRAINT_FAIL");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_unique_violation_maps_to_duplicate() {
        let err: SyncError =
            RepositoryError::constraint(ConstraintKind::Unique, "duplicate key").into();
        assert_eq!(err.code(), "DUPLICATE_REFERENCE_RANGE");
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn test_other_failures_are_sync_failures() {
        let err: SyncError = RepositoryError::connection("refused").into();
        assert_eq!(err.code(), "ANALYSIS_PARAM_SYNC_FAIL");
        assert_eq!(err.status(), 500);
        assert!(err.details().is_none());
    }

    #[test]
    fn test_overlap_details_carry_both_spans() {
        let err: SyncError = IntervalError::Overlap {
            sex: "Masculino".into(),
            prev: AgeSpan::new(Some(0), Some(18)),
            curr: AgeSpan::new(Some(10), Some(40)),
        }
        .into();
        let details = err.details().unwrap();
        assert_eq!(details["previous"]["age_max"], 18);
        assert_eq!(details["current"]["age_min"], 10);
        assert_eq!(err.code(), "REFERENCE_RANGE_OVERLAP");
    }

    #[test]
    fn test_constraint_snapshot_replaces_tokens() {
        let err = SyncError::ConstraintFail {
            message: "rejected".into(),
            allowed_tokens: Vec::new(),
            constraint_definitions: Vec::new(),
        }
        .with_constraint_snapshot(
            vec!["O".into(), "M".into(), "F".into()],
            vec!["CHECK (sex = ANY (ARRAY['M'::text]))".into()],
        );
        let details = err.details().unwrap();
        assert_eq!(details["allowedTokens"], json!(["O", "M", "F"]));
    }
}
