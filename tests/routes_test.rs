use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

mod common;

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_root() {
    let app = common::create_test_app().await;
    let (status, body) = send(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_health_live() {
    let app = common::create_test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_items_and_daily_queue() {
    let app = common::create_test_app().await;

    let (status, body) = send(&app, Method::GET, "/api/items", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 8);

    let (status, body) = send(&app, Method::GET, "/api/queue", None).await;
    assert_eq!(status, StatusCode::OK);
    let queue = body["data"].as_array().unwrap();
    assert_eq!(queue.len(), 5);
    assert_eq!(queue[0]["itemId"], "serendipity");
    assert_eq!(queue[0]["kind"], "new");
}

#[tokio::test]
async fn test_activate_unknown_item_is_not_found() {
    let app = common::create_test_app().await;
    let (status, body) = send(&app, Method::POST, "/api/items/nonexistent/activate", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_session_flow_over_http() {
    let app = common::create_test_app().await;

    let (status, body) = send(&app, Method::POST, "/api/items/ephemeral/activate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["stage"], "introduction");

    let (status, _) = send(&app, Method::POST, "/api/input", Some(json!({ "text": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Method::POST, "/api/input", Some(json!({ "text": "got it" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stage"], "recognition_check");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/interaction",
        Some(json!({ "step": "recognition_check", "outcome": "passed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stage"], "production_check");

    let (status, body) = send(&app, Method::GET, "/api/session", None).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot = &body["data"];
    assert_eq!(snapshot["activeItem"]["item"]["word"], "ephemeral");
    assert_eq!(snapshot["activeItem"]["mastery"]["recognition"], true);
    assert_eq!(snapshot["isTyping"], false);
    assert!(snapshot["transcript"].as_array().unwrap().len() >= 4);
}

#[tokio::test]
async fn test_learned_toggle_and_stats() {
    let app = common::create_test_app().await;

    let (status, body) = send(&app, Method::POST, "/api/learned/resilient/toggle", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["learned"], true);

    let (_, body) = send(&app, Method::GET, "/api/stats", None).await;
    assert_eq!(body["data"]["totalLearned"], 1);

    let (status, _) = send(&app, Method::POST, "/api/learned/nonexistent/toggle", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::POST, "/api/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["reset"], true);

    let (_, body) = send(&app, Method::GET, "/api/stats", None).await;
    assert_eq!(body["data"]["totalLearned"], 0);
}

#[tokio::test]
async fn test_auto_advance_and_countdown_endpoints() {
    let app = common::create_test_app().await;

    let (_, body) = send(&app, Method::POST, "/api/auto-advance/toggle", None).await;
    assert_eq!(body["data"]["enabled"], true);
    let (_, body) = send(&app, Method::POST, "/api/auto-advance/toggle", None).await;
    assert_eq!(body["data"]["enabled"], false);

    let (status, body) = send(&app, Method::POST, "/api/countdown/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cancelled"], false);
}

#[tokio::test]
async fn test_countdown_restart_and_next_endpoints() {
    let app = common::create_test_app().await;

    let (status, body) = send(&app, Method::POST, "/api/countdown/restart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["restarted"], false);

    let (_, body) = send(&app, Method::POST, "/api/next", None).await;
    assert_eq!(body["data"]["status"], "no_active_item");

    send(&app, Method::POST, "/api/items/ephemeral/activate", None).await;
    let (_, body) = send(&app, Method::POST, "/api/countdown/restart", None).await;
    assert_eq!(body["data"]["restarted"], false);

    let (status, body) = send(&app, Method::POST, "/api/next", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["itemId"], "serendipity");
    assert_eq!(body["data"]["stage"], "introduction");
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = common::create_test_app().await;
    let (status, _) = send(&app, Method::GET, "/api/nope", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
