//! Sex token normalization.
//!
//! Tenant databases disagree about how the `sex` column is spelled. Migrated
//! databases enforce a canonical triple (by default `Ambos`/`Masculino`/`Femenino`,
//! but the casing and spelling come from the live CHECK constraint), while
//! databases that were never migrated still enforce single letters `O`/`M`/`F`.
//!
//! [`SexVocabulary`] holds the triple discovered for one tenant. Normalization
//! never fails: anything unrecognized is treated as "both sexes".

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::settings;

pub const DEFAULT_BOTH_TOKEN: &str = "Ambos";
pub const DEFAULT_MALE_TOKEN: &str = "Masculino";
pub const DEFAULT_FEMALE_TOKEN: &str = "Femenino";

pub const LEGACY_BOTH_LETTER: &str = "O";
pub const LEGACY_MALE_LETTER: &str = "M";
pub const LEGACY_FEMALE_LETTER: &str = "F";

const BOTH_LITERALS: &[&str] = &[
    "ambos",
    "ambos sexos",
    "both",
    "todos",
    "all",
    "any",
    "unisex",
    "indistinto",
];
const MALE_LITERALS: &[&str] = &["masculino", "male", "hombre", "varon", "varón", "masc"];
const FEMALE_LITERALS: &[&str] = &["femenino", "female", "mujer", "fem"];

/// Semantic sex group of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SexKind {
    Both,
    Male,
    Female,
}

impl SexKind {
    pub const ALL: [SexKind; 3] = [SexKind::Both, SexKind::Male, SexKind::Female];

    /// Recognize a full-word spelling (Spanish or English). Input must already
    /// be trimmed and lowercased.
    pub fn from_literal(lowered: &str) -> Option<Self> {
        if BOTH_LITERALS.contains(&lowered) {
            Some(Self::Both)
        } else if MALE_LITERALS.contains(&lowered) {
            Some(Self::Male)
        } else if FEMALE_LITERALS.contains(&lowered) {
            Some(Self::Female)
        } else {
            None
        }
    }

    /// Recognize a legacy single-letter code, case-insensitively.
    pub fn from_legacy_letter(raw: &str) -> Option<Self> {
        match raw.trim() {
            l if l.eq_ignore_ascii_case(LEGACY_BOTH_LETTER) => Some(Self::Both),
            l if l.eq_ignore_ascii_case(LEGACY_MALE_LETTER) => Some(Self::Male),
            l if l.eq_ignore_ascii_case(LEGACY_FEMALE_LETTER) => Some(Self::Female),
            _ => None,
        }
    }

    pub fn legacy_letter(self) -> &'static str {
        match self {
            Self::Both => LEGACY_BOTH_LETTER,
            Self::Male => LEGACY_MALE_LETTER,
            Self::Female => LEGACY_FEMALE_LETTER,
        }
    }
}

/// The canonical sex triple enforced by one tenant database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SexVocabulary {
    pub both: String,
    pub male: String,
    pub female: String,
    /// The live constraint still holds the single-letter triple and lacks the
    /// canonical one, so stored values must be bridged to letters.
    pub legacy_active: bool,
}

impl Default for SexVocabulary {
    fn default() -> Self {
        Self::new(DEFAULT_BOTH_TOKEN, DEFAULT_MALE_TOKEN, DEFAULT_FEMALE_TOKEN, false)
    }
}

impl SexVocabulary {
    pub fn new(
        both: impl Into<String>,
        male: impl Into<String>,
        female: impl Into<String>,
        legacy_active: bool,
    ) -> Self {
        Self {
            both: both.into(),
            male: male.into(),
            female: female.into(),
            legacy_active,
        }
    }

    pub fn token(&self, kind: SexKind) -> &str {
        match kind {
            SexKind::Both => &self.both,
            SexKind::Male => &self.male,
            SexKind::Female => &self.female,
        }
    }

    /// Canonical tokens in `[both, male, female]` order.
    pub fn tokens(&self) -> [&str; 3] {
        [&self.both, &self.male, &self.female]
    }

    /// Tokens the live constraint accepts for writes.
    pub fn storage_tokens(&self) -> [&str; 3] {
        if self.legacy_active {
            [LEGACY_BOTH_LETTER, LEGACY_MALE_LETTER, LEGACY_FEMALE_LETTER]
        } else {
            self.tokens()
        }
    }

    /// Map free-form input onto a sex group.
    ///
    /// Order: empty input, the tenant's own tokens, known full-word spellings,
    /// legacy letters, then first-letter prefixes (`m*`, `f*`, `a*`).
    /// Unrecognized input falls back to [`SexKind::Both`].
    pub fn classify(&self, raw: &str) -> SexKind {
        let needle = raw.trim().to_lowercase();
        if needle.is_empty() {
            return SexKind::Both;
        }

        if let Some(kind) = SexKind::ALL
            .into_iter()
            .find(|kind| self.token(*kind).trim().to_lowercase() == needle)
        {
            return kind;
        }

        if let Some(kind) = SexKind::from_literal(&needle) {
            return kind;
        }

        if let Some(kind) = SexKind::from_legacy_letter(&needle) {
            return kind;
        }

        match needle.chars().next() {
            Some('m') => SexKind::Male,
            Some('f') => SexKind::Female,
            _ => SexKind::Both,
        }
    }

    /// Canonical token for free-form input.
    pub fn normalize(&self, raw: &str) -> String {
        let token = self.token(self.classify(raw)).to_string();
        if settings().debug_sex_tokens {
            debug!(raw = %raw, token = %token, "normalized sex token");
        }
        token
    }

    /// Map a canonical token to the legacy letter when the tenant has not been
    /// migrated. Identity otherwise, and for anything that is not one of the
    /// three canonical tokens.
    pub fn bridge_to_legacy(&self, token: &str) -> String {
        if !self.legacy_active {
            return token.to_string();
        }

        SexKind::ALL
            .into_iter()
            .find(|kind| self.token(*kind).eq_ignore_ascii_case(token.trim()))
            .map(|kind| kind.legacy_letter().to_string())
            .unwrap_or_else(|| token.to_string())
    }
}

/// Canonical token for free-form sex input.
pub fn normalize_sex(vocabulary: &SexVocabulary, raw: &str) -> String {
    vocabulary.normalize(raw)
}

/// Legacy single-letter encoding of a canonical token, when the tenant needs it.
pub fn bridge_to_legacy(vocabulary: &SexVocabulary, token: &str) -> String {
    vocabulary.bridge_to_legacy(token)
}
