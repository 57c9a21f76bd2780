//! Migration-state detection from live CHECK constraint definitions.
//!
//! Postgres renders a sex CHECK constraint in one of a few shapes, depending
//! on how it was declared and which server version dumped it:
//!
//! ```text
//! CHECK ((sex IN ('Ambos', 'Masculino', 'Femenino')))
//! CHECK (((sex)::text = ANY ((ARRAY['Ambos'::character varying, 'Masculino'::character varying])::text[])))
//! CHECK ((sex = ANY (ARRAY['M'::text, 'F'::text, 'O'::text])))
//! ```
//!
//! The parser pulls the quoted literals out of those shapes and decides which
//! vocabulary is enforced: the canonical triple, the legacy letters, or both.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::services::sex_tokens::{SexKind, SexVocabulary};

static IN_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bIN\s*\(([^)]*)\)").expect("valid IN-list regex"));
static ANY_ARRAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)ANY\s*\(\s*\(?\s*ARRAY\s*\[([^\]]*)\]").expect("valid ANY(ARRAY) regex")
});
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"'([^']*)'").expect("valid literal regex"));
static BARE_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(ambos|masculino|femenino)\b").expect("valid bare-token regex")
});

/// Narrow view of a tenant's sex-column migration state.
pub trait SexVocabularySource {
    /// `[both, male, female]` tokens and whether the legacy letter bridge is active.
    fn current_sex_vocabulary(&self) -> ([String; 3], bool);
}

impl SexVocabularySource for SexVocabulary {
    fn current_sex_vocabulary(&self) -> ([String; 3], bool) {
        (
            [self.both.clone(), self.male.clone(), self.female.clone()],
            self.legacy_active,
        )
    }
}

/// What the constraint definitions say about the sex column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintScan {
    /// Canonical `[both, male, female]` spellings, when all three were found.
    pub canonical: Option<[String; 3]>,
    /// The single-letter triple `O`/`M`/`F` is allowed.
    pub legacy_letters: bool,
}

impl ConstraintScan {
    /// Legacy bridge applies only when letters are allowed and the canonical
    /// triple is not.
    pub fn legacy_active(&self) -> bool {
        self.legacy_letters && self.canonical.is_none()
    }
}

/// Quoted literals from an `IN (...)` list or an `ANY (ARRAY[...])` list.
pub fn extract_literals(definition: &str) -> Vec<String> {
    let mut literals = Vec::new();
    for pattern in [&*IN_LIST, &*ANY_ARRAY] {
        for list in pattern.captures_iter(definition) {
            literals.extend(
                QUOTED
                    .captures_iter(&list[1])
                    .map(|literal| literal[1].to_string()),
            );
        }
    }
    literals
}

/// Scan every definition that mentions the sex column.
pub fn scan_definitions<S: AsRef<str>>(definitions: &[S]) -> ConstraintScan {
    let mut literals: Vec<String> = definitions
        .iter()
        .flat_map(|d| extract_literals(d.as_ref()))
        .collect();

    if literals.is_empty() {
        literals = definitions
            .iter()
            .flat_map(|d| {
                BARE_TOKENS
                    .captures_iter(d.as_ref())
                    .map(|c| c[1].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
    }

    let mut canonical: [Option<String>; 3] = [None, None, None];
    let mut letters = [false; 3];

    for literal in &literals {
        let trimmed = literal.trim();
        if let Some(kind) = SexKind::from_literal(&trimmed.to_lowercase()) {
            let slot = &mut canonical[kind_index(kind)];
            if slot.is_none() {
                *slot = Some(trimmed.to_string());
            }
        } else if trimmed.len() == 1 {
            if let Some(kind) = SexKind::from_legacy_letter(trimmed) {
                letters[kind_index(kind)] = true;
            }
        }
    }

    let canonical = match canonical {
        [Some(both), Some(male), Some(female)] => Some([both, male, female]),
        _ => None,
    };

    ConstraintScan {
        canonical,
        legacy_letters: letters.iter().all(|l| *l),
    }
}

fn kind_index(kind: SexKind) -> usize {
    match kind {
        SexKind::Both => 0,
        SexKind::Male => 1,
        SexKind::Female => 2,
    }
}

/// Constraint definitions captured from a live database, with the vocabulary
/// to keep when they cannot be interpreted.
#[derive(Debug, Clone)]
pub struct ConstraintSnapshot {
    pub definitions: Vec<String>,
    pub fallback: SexVocabulary,
}

impl ConstraintSnapshot {
    pub fn new(definitions: Vec<String>, fallback: SexVocabulary) -> Self {
        Self {
            definitions,
            fallback,
        }
    }

    pub fn vocabulary(&self) -> SexVocabulary {
        let ([both, male, female], legacy_active) = self.current_sex_vocabulary();
        SexVocabulary::new(both, male, female, legacy_active)
    }
}

impl SexVocabularySource for ConstraintSnapshot {
    fn current_sex_vocabulary(&self) -> ([String; 3], bool) {
        let scan = scan_definitions(self.definitions.as_slice());
        let legacy_active = scan.legacy_active();
        let tokens = match scan.canonical {
            Some(tokens) => tokens,
            None => self.fallback.current_sex_vocabulary().0,
        };
        (tokens, legacy_active)
    }
}
