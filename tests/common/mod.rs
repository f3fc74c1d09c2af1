use abtest::{ExperimentManager, ExperimentStore};
use abtest_http::handlers::AppState;
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// Router over a file-backed store rooted at `tmp`.
#[allow(dead_code)]
pub fn file_backed_app(tmp: &TempDir) -> Router {
    let store = ExperimentStore::open(tmp.path()).unwrap();
    let manager = ExperimentManager::new(Arc::new(store));
    abtest_http::router(Arc::new(AppState::new(manager)))
}

#[allow(dead_code)]
pub fn subject_test_body(variants: usize, total_audience: u64) -> Value {
    let variants: Vec<Value> = (0..variants)
        .map(|i| {
            json!({
                "name": format!("Variant {}", (b'A' + i as u8) as char),
                "subject": format!("Subject {i}")
            })
        })
        .collect();
    json!({
        "campaignId": "spring-sale",
        "name": "Spring sale subject line",
        "testType": "subject",
        "variants": variants,
        "totalAudience": total_audience
    })
}

#[allow(dead_code)]
pub async fn send_json_request(app: &Router, method: Method, uri: &str, body: Value) -> axum::http::Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

#[allow(dead_code)]
pub async fn send_empty_request(app: &Router, method: Method, uri: &str) -> axum::http::Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

#[allow(dead_code)]
pub async fn body_json(resp: axum::http::Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[allow(dead_code)]
pub async fn create_and_start(app: &Router, variants: usize, total_audience: u64) -> String {
    let resp = send_json_request(
        app,
        Method::POST,
        "/ab-tests",
        subject_test_body(variants, total_audience),
    )
    .await;
    let id = body_json(resp).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let resp = send_empty_request(app, Method::POST, &format!("/ab-tests/{id}/start")).await;
    assert_eq!(resp.status(), axum::http::StatusCode::OK);
    id
}
