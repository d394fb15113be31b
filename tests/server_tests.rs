//! HTTP surface tests.
//!
//! Drives the full router with in-process requests. Upstream-dependent
//! paths point at an unroutable local port, so transport failures exercise
//! the error classification and rewriting paths.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use anthromux::Config;
use anthromux::create_app;

/// Config whose upstream refuses connections immediately.
fn test_config() -> Config {
    let mut config = Config::default();
    config.upstream.base_url = "http://127.0.0.1:9".to_string();
    config.upstream.api_key = "sk-test".to_string();
    config.retry.enabled = false;
    config
}

fn app() -> axum::Router {
    create_app(test_config()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn invalid_json_body_yields_error_envelope() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let envelope = body_json(response).await;
    assert_eq!(envelope["type"], "error");
    assert_eq!(envelope["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn missing_messages_field_is_rejected() {
    let response = app()
        .oneshot(post_json("/v1/messages", json!({"model": "m", "max_tokens": 10})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["type"], "invalid_request_error");
    assert!(envelope["error"]["message"].as_str().unwrap().contains("messages"));
}

#[tokio::test]
async fn malformed_message_item_is_unprocessable() {
    let response = app()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "m", "messages": [{"content": "no role"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn unreachable_upstream_is_an_api_error() {
    let response = app()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let envelope = body_json(response).await;
    assert_eq!(envelope["type"], "error");
    assert_eq!(envelope["error"]["type"], "api_error");
}

#[tokio::test]
async fn streaming_error_arrives_as_complete_sse_stream() {
    let response = app()
        .oneshot(post_json(
            "/v1/messages",
            json!({
                "model": "m",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ))
        .await
        .unwrap();

    // The status reflects the real condition; the body is still a fully
    // formed event stream.
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("text/event-stream")
    );

    let body = body_text(response).await;
    assert!(body.contains("message_start"));
    assert!(body.contains("content_block_start"));
    assert!(body.contains("message_stop"));
    assert!(body.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn count_tokens_estimates_characters_over_four() {
    let response = app()
        .oneshot(post_json(
            "/v1/messages/count_tokens",
            json!({
                "model": "claude-3-haiku-20240307",
                "messages": [{"role": "user", "content": "abcdefgh"}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["model"], "claude-3-haiku-20240307");
    assert_eq!(body["usage"]["input_tokens"], 2);
    assert_eq!(body["usage"]["output_tokens"], 0);
}

#[tokio::test]
async fn health_reports_metrics() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["metrics"]["total_requests"].is_u64());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn models_endpoint_wraps_upstream_failure() {
    let response = app()
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["type"], "api_error");
}
