use std::sync::Arc;
use std::time::Duration;

use annotation_server::{build_router, build_search_engine, config::AppConfig, state::AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

// Nothing listens on port 1, so every query fails fast.
const UNREACHABLE_DB: &str = "postgres://annotator@127.0.0.1:1/annotations";

fn app() -> Router {
    let cfg = AppConfig::from_lookup(|k| (k == "DATABASE_URL").then(|| UNREACHABLE_DB.to_string())).unwrap();
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(500))
        .connect_lazy(&cfg.database_url)
        .unwrap();
    let search = build_search_engine(&cfg);
    build_router(Arc::new(AppState::new(pool, cfg, search)))
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let req = Request::get("/api/v1/datasets").body(Body::empty()).unwrap();
    let (status, body) = send(app(), req).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"]["code"], "unauthorized");
    assert!(body["detail"]["message"].as_str().unwrap().contains("X-Argilla-Api-Key"));
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let req = Request::get("/api/v1/nothing-here").body(Body::empty()).unwrap();
    let (status, _) = send(app(), req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_is_public_and_reports_database() {
    let req = Request::get("/api/v1/status").body(Body::empty()).unwrap();
    let (status, body) = send(app(), req).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["database"], "unavailable");
    assert_eq!(body["search_engine"]["name"], "memory");
    assert_eq!(body["search_engine"]["status"], "ok");
}

#[tokio::test]
async fn database_failures_hide_details() {
    let req = Request::get("/api/v1/me")
        .header("X-Argilla-Api-Key", "some-api-key")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(), req).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["detail"]["code"], "internal_error");
    assert_eq!(body["detail"]["message"], "database error");
}
