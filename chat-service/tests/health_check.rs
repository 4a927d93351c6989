mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestApp;

#[tokio::test]
async fn health_check_reports_model_and_store() {
    let app = TestApp::spawn().await;

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "chat-service");
    assert_eq!(body["model_loaded"], false);
    assert_eq!(body["model_info"]["model_name"], "Not loaded");
    assert_eq!(body["database"]["status"], "ok");

    let app = TestApp::with_model("echo").await;
    let (_, body) = app.get("/health").await;
    assert_eq!(body["model_loaded"], true);
    assert_eq!(body["model_info"]["model_id"], "echo");
}

#[tokio::test]
async fn index_lists_endpoints() {
    let app = TestApp::spawn().await;

    let (status, body) = app.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["endpoints"]["generate_stream"], "POST /generate/stream");
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::spawn().await;

    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "trace-me")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-request-id"], "trace-me");
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    chat_service::services::metrics::init_metrics().unwrap();
    let app = TestApp::spawn().await;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, _, bytes) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("chat_model_loaded"));
}
