//! Engine settings read from the environment.
//!
//! # Environment Variables
//! - `DEBUG_SYNC_RANGES`: trace per-parameter expansion output during sync
//! - `DEBUG_SEX_TOKENS`: trace every sex-token normalization
//! - `SCHEMA_CACHE_TTL_SECS`: lifetime of a tenant's introspected schema (default: 60)
//!
//! The debug toggles only add `tracing::debug!` output; they never change behavior.

use std::sync::OnceLock;
use std::time::Duration;

/// Default lifetime of a cached schema snapshot.
pub const DEFAULT_SCHEMA_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub debug_sync_ranges: bool,
    pub debug_sex_tokens: bool,
    pub schema_cache_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debug_sync_ranges: false,
            debug_sex_tokens: false,
            schema_cache_ttl: DEFAULT_SCHEMA_CACHE_TTL,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let schema_cache_ttl = std::env::var("SCHEMA_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SCHEMA_CACHE_TTL);

        Self {
            debug_sync_ranges: env_flag("DEBUG_SYNC_RANGES"),
            debug_sex_tokens: env_flag("DEBUG_SEX_TOKENS"),
            schema_cache_ttl,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

static SETTINGS: OnceLock<EngineSettings> = OnceLock::new();

/// Process settings, read from the environment on first access.
pub fn settings() -> &'static EngineSettings {
    SETTINGS.get_or_init(EngineSettings::from_env)
}
