//! Router-level tests driven through `tower::ServiceExt::oneshot`.
#![cfg(feature = "http-server")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use lab_ranges::db::repositories::LocalRepository;
use lab_ranges::db::repository::ReferenceRangeRepository;
use lab_ranges::db::schema_cache::SchemaInfo;
use lab_ranges::http::{create_router, AppState};

fn app(repo: &LocalRepository) -> Router {
    let repository = Arc::new(repo.clone()) as Arc<dyn ReferenceRangeRepository>;
    create_router(AppState::new(repository))
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    send_as(app, method, uri, body, None).await
}

async fn send_as(
    app: Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    tenant: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(tenant) = tenant {
        builder = builder.header("X-Tenant-Id", tenant);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_database_status() {
    let repo = LocalRepository::new();
    let (status, body) = send(app(&repo), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "connected");
    assert!(body["latency_ms"].is_u64());
    assert!(body.get("pool").is_none());

    repo.set_healthy(false);
    let (_, body) = send(app(&repo), Method::GET, "/health", None).await;
    assert_eq!(body["database"], "disconnected");
}

#[tokio::test]
async fn test_sync_endpoint_returns_parameters_and_meta() {
    let repo = LocalRepository::new();
    let (status, body) = send(
        app(&repo),
        Method::POST,
        "/api/analysis/12/parameters-sync",
        Some(json!({
            "parameters": [{
                "name": "Glucosa",
                "unit": "mg/dL",
                "valorReferencia": [{"sexo": "Ambos", "edad_min": 18, "edad_max": 65, "valor_min": 70, "valor_max": 110}]
            }]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["insertedRanges"], 3);
    assert_eq!(body["meta"]["requestId"].as_str().unwrap().len(), 36);
    let parameter = &body["parameters"][0];
    assert_eq!(parameter["name"], "Glucosa");
    assert_eq!(parameter["reference_ranges"].as_array().unwrap().len(), 3);

    let (status, listed) = send(app(&repo), Method::GET, "/api/analysis/12/parameters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(listed[0].get("reference_ranges").is_none());
}

#[tokio::test]
async fn test_overlap_maps_to_bad_request_with_code() {
    let repo = LocalRepository::new();
    let (status, body) = send(
        app(&repo),
        Method::POST,
        "/api/analysis/1/parameters-sync",
        Some(json!({
            "parameters": [{
                "name": "Acido urico",
                "reference_ranges": [
                    {"sex": "F", "age_min": 0, "age_max": 17, "lower": 1, "upper": 2},
                    {"sex": "F", "age_min": 10, "age_max": 30, "lower": 3, "upper": 4}
                ]
            }]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "REFERENCE_RANGE_OVERLAP");
    assert_eq!(body["details"]["previous"]["age_max"], 17);
    assert_eq!(body["details"]["current"]["age_min"], 10);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let repo = LocalRepository::new();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/analysis/1/parameters-sync")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app(&repo).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_single_range_endpoints() {
    let repo = LocalRepository::new();
    let parameter = repo.seed_parameter(5.into(), "Hierro");
    let ranges_uri = format!("/api/analysis/parameters/{}/reference-ranges", parameter);

    let (status, created) = send(
        app(&repo),
        Method::POST,
        &ranges_uri,
        Some(json!({"sexo": "hombre", "edad_min": 18, "valor_min": 65, "valor_max": 175})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["sex"], "Masculino");
    let range_id = created["id"].as_i64().unwrap();

    let (status, dup) = send(
        app(&repo),
        Method::POST,
        &ranges_uri,
        Some(json!({"sex": "M", "age_min": 18, "lower": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(dup["code"], "REFERENCE_RANGE_OVERLAP");

    let (status, updated) = send(
        app(&repo),
        Method::PUT,
        &format!("/api/analysis/reference-ranges/{}", range_id),
        Some(json!({"sex": "M", "age_min": 18, "lower": 70, "upper": 180})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["lower"], 70.0);

    let (status, listed) = send(app(&repo), Method::GET, &ranges_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let delete_uri = format!("/api/analysis/reference-ranges/{}", range_id);
    let (status, _) = send(app(&repo), Method::DELETE, &delete_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(app(&repo), Method::DELETE, &delete_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_inverted_bounds_are_invalid_interval() {
    let repo = LocalRepository::new();
    let parameter = repo.seed_parameter(5.into(), "Magnesio");
    let (status, body) = send(
        app(&repo),
        Method::POST,
        &format!("/api/analysis/parameters/{}/reference-ranges", parameter),
        Some(json!({"lower": 2.6, "upper": 1.7})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_RANGE_INTERVAL");
}

#[tokio::test]
async fn test_constraint_failure_carries_allowed_tokens() {
    let repo = LocalRepository::new();
    let (status, _) = send_as(
        app(&repo),
        Method::GET,
        "/api/analysis/3/parameters",
        None,
        Some("clinic-9"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    repo.set_live_schema(SchemaInfo::legacy());

    let (status, body) = send_as(
        app(&repo),
        Method::POST,
        "/api/analysis/3/parameters-sync",
        Some(json!({"parameters": [{"name": "PCR", "reference_ranges": [{"upper": 5}]}]})),
        Some("clinic-9"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "REFERENCE_RANGE_CONSTRAINT_FAIL");
    assert_eq!(body["details"]["allowedTokens"], json!(["O", "M", "F"]));
}

#[tokio::test]
async fn test_unhealthy_store_is_a_sync_failure() {
    let repo = LocalRepository::new();
    repo.set_healthy(false);
    let (status, body) = send(
        app(&repo),
        Method::POST,
        "/api/analysis/1/parameters-sync",
        Some(json!({"parameters": []})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "ANALYSIS_PARAM_SYNC_FAIL");
}
