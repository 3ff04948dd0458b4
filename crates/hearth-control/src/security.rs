use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;

use crate::{auth::request_token, state::AppState};

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, axum::Json(ErrorBody { message: message.into() })).into_response()
}

fn is_unsafe_method(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// A missing Origin is a non-browser client (curl, scripts) and passes.
pub fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };
    allowed.iter().any(|a| a == origin)
}

// Middleware: Origin allowlist on state-changing requests.
pub async fn origin_guard(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if is_unsafe_method(req.method()) && !origin_is_allowed(req.headers(), &state.allowed_origins) {
        return json_error(StatusCode::FORBIDDEN, "origin not allowed");
    }
    next.run(req).await
}

// Middleware: resolves the caller from a bearer header or the access cookie
// and attaches the AuthContext for handlers.
pub async fn require_auth(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Response {
    let jar = CookieJar::from_headers(req.headers());
    let Some(token) = request_token(req.headers(), &jar, None) else {
        return json_error(StatusCode::UNAUTHORIZED, "missing access token");
    };
    match state.tokens.authenticate(&token) {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!(error = %e, "rejected request token");
            json_error(StatusCode::UNAUTHORIZED, "invalid access token")
        }
    }
}
