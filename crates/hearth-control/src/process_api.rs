use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hearth_agent::{GameStatus, config::format_error_chain};
use hearth_process::{ProcessAction, ProcessControlRequest, ProcessStatusResponse};
use serde::Serialize;

use crate::{auth::AuthContext, security::json_error, state::AppState};

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    game: hearth_process::ProcessStatus,
    sessions: usize,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        game: state.supervisor.status(),
        sessions: state.sessions.len(),
    })
}

pub async fn process_status(State(state): State<AppState>) -> Json<ProcessStatusResponse> {
    Json(snapshot(&state).await)
}

/// Starts or stops the game. Admin only.
///
/// Start returns once the process is spawned; stop is acknowledged with 202
/// and carried out in the background, escalating to a kill on timeout.
pub async fn process_control(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ProcessControlRequest>,
) -> Response {
    if !auth.is_admin() {
        return json_error(StatusCode::FORBIDDEN, "forbidden");
    }

    let sup = &state.supervisor;
    match req.action {
        ProcessAction::Start => {
            if !sup.init_start() {
                return json_error(
                    StatusCode::CONFLICT,
                    format!("cannot start: game is {} or its executable is missing", sup.status()),
                );
            }
            tracing::info!(principal = %auth.principal(), "game start requested");
            if let Err(e) = sup.start().await {
                let err = anyhow::Error::new(e);
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, format_error_chain(&err));
            }
            (StatusCode::OK, Json(snapshot(&state).await)).into_response()
        }
        ProcessAction::Stop => {
            if !sup.init_stop() {
                return json_error(
                    StatusCode::CONFLICT,
                    format!("cannot stop: game is {}", sup.status()),
                );
            }
            tracing::info!(principal = %auth.principal(), "game stop requested");
            let sup = sup.clone();
            tokio::spawn(async move {
                let timeout = sup.config().stop_timeout;
                if !sup.stop_forcibly(timeout).await {
                    tracing::error!("game process did not exit after kill");
                }
            });
            (StatusCode::ACCEPTED, Json(snapshot(&state).await)).into_response()
        }
    }
}

async fn snapshot(state: &AppState) -> ProcessStatusResponse {
    ProcessStatusResponse {
        status: state.supervisor.status(),
        pid: state.supervisor.pid().await,
    }
}

/// Server List Ping against the running game. Offline on any failure.
pub async fn game_status(State(state): State<AppState>) -> Json<GameStatus> {
    Json(state.probe.probe().await)
}
