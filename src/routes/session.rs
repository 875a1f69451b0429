use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::response::{ok, AppError};
use crate::session::stage::{InteractionOutcome, Stage};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/items", get(list_items))
        .route("/items/:id/activate", post(activate_item))
        .route("/queue", get(daily_queue))
        .route("/stats", get(stats))
        .route("/session", get(snapshot))
        .route("/input", post(submit_input))
        .route("/interaction", post(submit_interaction))
        .route("/idle", post(idle))
        .route("/countdown/cancel", post(cancel_countdown))
        .route("/countdown/restart", post(restart_countdown))
        .route("/next", post(next_item))
        .route("/auto-advance/toggle", post(toggle_auto_advance))
        .route("/learned/:id/toggle", post(toggle_learned))
        .route("/reset", post(reset))
}

#[derive(Debug, Deserialize)]
struct InputBody {
    text: String,
}

#[derive(Debug, Deserialize)]
struct InteractionBody {
    step: Stage,
    outcome: InteractionOutcome,
}

#[derive(Serialize)]
struct CountdownResponse {
    cancelled: bool,
}

#[derive(Serialize)]
struct CountdownRestartResponse {
    restarted: bool,
}

#[derive(Serialize)]
struct AutoAdvanceResponse {
    enabled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LearnedResponse {
    item_id: String,
    learned: bool,
}

#[derive(Serialize)]
struct ResetResponse {
    reset: bool,
}

async fn list_items(State(state): State<AppState>) -> Response {
    ok(state.orchestrator().catalog().items()).into_response()
}

async fn activate_item(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, AppError> {
    let orchestrator = state.orchestrator();
    if !orchestrator.catalog().contains(&id) {
        return Err(AppError::not_found(format!("unknown item: {id}")));
    }
    Ok(ok(orchestrator.activate_item(&id).await).into_response())
}

async fn daily_queue(State(state): State<AppState>) -> Response {
    ok(state.orchestrator().get_daily_queue()).into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    ok(state.orchestrator().get_stats()).into_response()
}

async fn snapshot(State(state): State<AppState>) -> Response {
    ok(state.orchestrator().snapshot()).into_response()
}

async fn submit_input(State(state): State<AppState>, Json(body): Json<InputBody>) -> Result<Response, AppError> {
    if body.text.trim().is_empty() {
        return Err(AppError::bad_request("text must not be empty"));
    }
    Ok(ok(state.orchestrator().submit_user_input(&body.text).await).into_response())
}

async fn submit_interaction(State(state): State<AppState>, Json(body): Json<InteractionBody>) -> Response {
    let report = state
        .orchestrator()
        .submit_interaction_result(body.step, body.outcome)
        .await;
    ok(report).into_response()
}

async fn idle(State(state): State<AppState>) -> Response {
    ok(state.orchestrator().on_idle_timeout().await).into_response()
}

async fn cancel_countdown(State(state): State<AppState>) -> Response {
    let cancelled = state.orchestrator().cancel_countdown();
    ok(CountdownResponse { cancelled }).into_response()
}

async fn restart_countdown(State(state): State<AppState>) -> Response {
    let restarted = state.orchestrator().restart_countdown();
    ok(CountdownRestartResponse { restarted }).into_response()
}

async fn next_item(State(state): State<AppState>) -> Response {
    ok(state.orchestrator().advance_to_next_item().await).into_response()
}

async fn toggle_auto_advance(State(state): State<AppState>) -> Response {
    let enabled = state.orchestrator().toggle_auto_advance().await;
    ok(AutoAdvanceResponse { enabled }).into_response()
}

async fn toggle_learned(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, AppError> {
    let learned = state
        .orchestrator()
        .toggle_learned(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("unknown item: {id}")))?;
    Ok(ok(LearnedResponse { item_id: id, learned }).into_response())
}

async fn reset(State(state): State<AppState>) -> Response {
    state.orchestrator().reset_all_data().await;
    ok(ResetResponse { reset: true }).into_response()
}
