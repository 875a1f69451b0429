use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/live", get(live))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime: u64,
    start_time: String,
    event_subscribers: usize,
    timestamp: String,
}

async fn root(State(state): State<AppState>) -> Response {
    let started: DateTime<Utc> = state.started_at_system().into();
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_seconds(),
        start_time: started.to_rfc3339_opts(SecondsFormat::Millis, true),
        event_subscribers: state.events().subscriber_count(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
    .into_response()
}

async fn live() -> &'static str {
    "ok"
}
