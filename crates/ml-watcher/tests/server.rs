//! HTTP surface tests.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use common::{reconciler, FakePlatform};
use ml_watcher::config::ServerConfig;
use ml_watcher::server::router;
use ml_watcher::{Reconciler, TaskState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn app(reconciler: Arc<Reconciler>) -> axum::Router {
    router(reconciler, &ServerConfig::default())
}

async fn call(app: axum::Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn health_is_always_ok() {
    let platform = FakePlatform::new();
    let app = app(Arc::new(reconciler(&platform)));

    let (status, body) = call(app, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "ml-watcher");
}

#[tokio::test]
async fn ready_after_first_tick() {
    let platform = FakePlatform::new();
    let reconciler = Arc::new(reconciler(&platform));

    let (status, _) = call(app(reconciler.clone()), Method::GET, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // a failing tick still counts: the loop is alive
    reconciler.tick().await;
    let (status, body) = call(app(reconciler), Method::GET, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ticks"], 1);
}

#[tokio::test]
async fn status_reports_marker_and_outstanding_tasks() {
    let platform = FakePlatform::new();
    platform.set_dataset("ds1");
    let reconciler = Arc::new(reconciler(&platform));
    reconciler.tick().await.action.unwrap();

    let (status, body) = call(app(reconciler), Method::GET, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["lastFingerprint"],
        platform.current_fingerprint().as_str()
    );
    let task = platform.job_names().remove(0);
    assert_eq!(body["outstanding"][&task]["dataset"], "ds1");
    assert_eq!(body["outstanding"][&task]["restartPending"], false);
}

#[tokio::test]
async fn resubmit_clears_marker() {
    let platform = FakePlatform::new();
    platform.set_dataset("ds1");
    let reconciler = Arc::new(reconciler(&platform));
    reconciler.tick().await.action.unwrap();
    let task = platform.job_names().remove(0);
    platform.set_state(&task, TaskState::Succeeded);

    let (status, body) = call(app(reconciler.clone()), Method::POST, "/resubmit").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert!(reconciler.state().lock().await.last_fingerprint.is_none());

    reconciler.tick().await.action.unwrap();
    assert_eq!(platform.create_calls(), 2);
}

#[tokio::test]
async fn resubmit_rejects_get() {
    let platform = FakePlatform::new();
    let app = app(Arc::new(reconciler(&platform)));

    let (status, _) = call(app, Method::GET, "/resubmit").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn resubmit_can_be_switched_off() {
    let platform = FakePlatform::new();
    platform.set_dataset("ds1");
    let reconciler = Arc::new(reconciler(&platform));
    reconciler.tick().await.action.unwrap();

    let config = ServerConfig {
        allow_resubmit: false,
        ..ServerConfig::default()
    };
    let app = router(reconciler.clone(), &config);
    let (status, _) = call(app, Method::POST, "/resubmit").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(reconciler.state().lock().await.last_fingerprint.is_some());

    let (status, _) = call(router(reconciler, &config), Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
}
