use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::state::{AppState, ControlCommand};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResp {
    pub(crate) status: &'static str,
    pub(crate) market_id: String,
    pub(crate) paused: bool,
    pub(crate) phase: calibration::CalibrationPhase,
    pub(crate) halted: bool,
    pub(crate) silent_ms: Option<i64>,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state/quote", get(quote_state))
        .route("/state/calibration", get(calibration_state))
        .route("/control/pause", post(pause))
        .route("/control/resume", post(resume))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    Json(health_report(&state).await)
}

pub(crate) async fn health_report(state: &AppState) -> HealthResp {
    let paused = *state.paused.read().await;
    let snapshot = state.snapshot.borrow().clone();
    let halted = state.quote.read().halted.is_some();
    let now_ms = state.clock.now_ms();
    let silent_ms = snapshot.market.last_book_recv_ms.map(|ts| (now_ms - ts).max(0));
    HealthResp {
        status: if halted { "halted" } else { "ok" },
        market_id: state.market_id.clone(),
        paused,
        phase: snapshot.phase,
        halted,
        silent_ms,
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

async fn quote_state(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.quote.read().clone();
    Json(view)
}

async fn calibration_state(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.calibration.borrow().clone();
    Json((*view).clone())
}

async fn pause(State(state): State<AppState>) -> impl IntoResponse {
    *state.paused.write().await = true;
    send_command(&state, ControlCommand::Pause, true).await
}

async fn resume(State(state): State<AppState>) -> impl IntoResponse {
    *state.paused.write().await = false;
    send_command(&state, ControlCommand::Resume, false).await
}

async fn send_command(
    state: &AppState,
    cmd: ControlCommand,
    paused: bool,
) -> axum::response::Response {
    match state.control_tx.send(cmd).await {
        Ok(()) => Json(serde_json::json!({"ok": true, "paused": paused})).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ok": false, "error": err.to_string()})),
        )
            .into_response(),
    }
}
