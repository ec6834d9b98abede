//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use herald_api::routes::create_router;
use herald_api::state::AppState;

async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
    let app = create_router(AppState::new());
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_reports_ok() {
    let (status, json) = get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "herald");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["uptime_secs"], 0);

    let timestamp = json["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (status, _) = get("/subscriptions").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
