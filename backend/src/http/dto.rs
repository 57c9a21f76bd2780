//! Request and response bodies.

use serde::{Deserialize, Serialize};

use crate::db::PoolStats;
use crate::models::{ParameterInput, UnifiedParameter};

/// Body of `POST /api/analysis/{id}/parameters-sync`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub parameters: Vec<ParameterInput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub request_id: String,
    pub inserted_ranges: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub parameters: Vec<UnifiedParameter>,
    pub meta: SyncMeta,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    /// Round trip of the database probe.
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}
