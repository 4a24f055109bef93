//! Liveness, readiness and version endpoints. None of these are namespace-scoped.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use http::{StatusCode, header};
use tower_cookies::{Cookie, Cookies};

use crate::{AppState, auth::ACCESS_TOKEN_COOKIE};

/// Liveness check. Succeeds while the process is serving.
#[tracing::instrument(name = "health.liveness")]
pub async fn health() -> &'static str {
    "OK"
}

/// Readiness check. Checks that the database answers.
#[tracing::instrument(name = "health.readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Store a bearer token in the `access_token` cookie and send the browser home.
pub async fn set_access_token_cookie(
    cookies: Cookies,
    Path(access_token): Path<String>,
) -> impl IntoResponse {
    let mut cookie = Cookie::new(ACCESS_TOKEN_COOKIE, access_token);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookies.add(cookie);
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/")])
}
