//! Application state and per-request tenant extraction.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::db::repository::ReferenceRangeRepository;
use crate::db::schema_cache::TenantKey;

/// Header naming the tenant whose schema snapshot applies.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn ReferenceRangeRepository>,
}

impl AppState {
    pub fn new(repository: Arc<dyn ReferenceRangeRepository>) -> Self {
        Self { repository }
    }
}

/// Tenant taken from `X-Tenant-Id`; blank or missing means `"default"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub TenantKey);

impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(TenantKey::new)
            .unwrap_or_default();
        Ok(Tenant(key))
    }
}
