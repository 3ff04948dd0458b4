pub mod auth;
pub mod config;
pub mod console;
pub mod console_ws;
pub mod messages;
pub mod pipeline;
pub mod process_api;
pub mod security;
pub mod session_sweeper;
pub mod sessions;
pub mod state;

use axum::{
    Router, middleware,
    routing::get,
};

pub use state::AppState;

/// The HTTP surface. `/game/process` and the history tail sit behind token
/// auth; the console socket authenticates during the upgrade itself.
pub fn app(state: AppState) -> Router {
    let authed = Router::new()
        .route(
            "/game/process",
            get(process_api::process_status).post(process_api::process_control),
        )
        .route("/game/console/history", get(console_ws::console_history))
        .layer(middleware::from_fn_with_state(state.clone(), security::require_auth));

    Router::new()
        .route("/healthz", get(process_api::healthz))
        .route("/game/status", get(process_api::game_status))
        .route("/game/console", get(console_ws::console_ws))
        .merge(authed)
        .layer(middleware::from_fn_with_state(state.clone(), security::origin_guard))
        .with_state(state)
}
