//! Router configuration for the HTTP API.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::state::AppState;

/// Create the main application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Permissive CORS; deployments put the API behind their own gateway.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let analysis = Router::new()
        .route("/{id}/parameters", get(handlers::list_parameters))
        .route("/{id}/parameters-sync", post(handlers::sync_parameters))
        .route(
            "/parameters/{param_id}/reference-ranges",
            get(handlers::list_reference_ranges).post(handlers::create_reference_range),
        )
        .route(
            "/reference-ranges/{range_id}",
            put(handlers::update_reference_range).delete(handlers::delete_reference_range),
        );

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/analysis", analysis)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
