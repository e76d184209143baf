//! Health, readiness and status endpoints, plus operator-forced re-submission.

use crate::config::ServerConfig;
use crate::reconciler::Reconciler;
use crate::state::WatcherState;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Build the router. `POST /resubmit` is only mounted when the config allows it.
pub fn router(reconciler: Arc<Reconciler>, config: &ServerConfig) -> Router {
    let mut app: Router<Arc<Reconciler>> = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(status));
    if config.allow_resubmit {
        app = app.route("/resubmit", post(resubmit));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            )
            .layer(TimeoutLayer::new(Duration::from_secs(30))),
    )
    .with_state(reconciler)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "ml-watcher",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready once the first tick has completed.
async fn readiness_check(
    State(reconciler): State<Arc<Reconciler>>,
) -> Result<Json<Value>, StatusCode> {
    let ticks = reconciler.state().lock().await.ticks;
    if ticks == 0 {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "ticks": ticks
    })))
}

async fn status(State(reconciler): State<Arc<Reconciler>>) -> Json<WatcherState> {
    let snapshot = reconciler.state().lock().await.clone();
    Json(snapshot)
}

async fn resubmit(State(reconciler): State<Arc<Reconciler>>) -> (StatusCode, Json<Value>) {
    reconciler.request_resubmit().await;
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "message": "regeneration will be re-submitted on the next tick"
        })),
    )
}
