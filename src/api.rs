//! Pull-only status facade for dashboards. Nothing is pushed; clients poll.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::budget::BudgetReport;
use crate::orchestrator::{Orchestrator, StatusSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/budget", get(budget))
        .route("/sources/{name}", get(latest_envelope))
        .route("/sources/{name}/restart", post(restart_source))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.orchestrator.status())
}

async fn budget(State(state): State<AppState>) -> Json<Option<BudgetReport>> {
    Json(state.orchestrator.budget().map(|b| b.report()))
}

#[derive(serde::Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: msg.into() })).into_response()
}

async fn latest_envelope(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.sink().load(&name) {
        Ok(Some(env)) => Json(env).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("no data for source '{name}'")),
        Err(crate::sink::PersistError::InvalidName(_)) => {
            error(StatusCode::BAD_REQUEST, "invalid source name")
        }
        Err(e) => {
            tracing::warn!(error = %e, source = %name, "failed to read envelope");
            error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read envelope")
        }
    }
}

#[derive(serde::Serialize)]
struct RestartOut {
    source: String,
    running: bool,
}

async fn restart_source(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if !state.orchestrator.restart(&name) {
        return error(StatusCode::NOT_FOUND, format!("unknown source '{name}'"));
    }
    let running = state
        .orchestrator
        .get(&name)
        .map(|f| f.is_running())
        .unwrap_or(false);
    tracing::info!(source = %name, "source restarted via api");
    Json(RestartOut {
        source: name,
        running,
    })
    .into_response()
}
