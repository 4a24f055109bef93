pub mod admin;
pub mod chooser;
pub mod health;

use axum::{
    Router,
    http::StatusCode,
    routing::{any, get},
};

use crate::AppState;

/// Prefixes of the tracking APIs. Their handlers live outside this crate; requests
/// under them are authorized here and answered 404 when nothing is mounted.
pub const BUSINESS_API_PREFIXES: [&str; 4] = [
    "/aim/api",
    "/api/2.0/mlflow",
    "/ajax-api/2.0/mlflow",
    "/mlflow/ajax-api/2.0/mlflow",
];

/// Routes served per namespace, at the root for `default` and under `/ns/{namespace}`.
pub fn namespace_routes() -> Router<AppState> {
    let mut router = Router::new()
        .route("/chooser/namespaces", get(chooser::list_namespaces))
        .route(
            "/chooser/namespaces/current",
            get(chooser::current_namespace),
        );
    for prefix in BUSINESS_API_PREFIXES {
        router = router
            .route(prefix, any(unmatched))
            .route(&format!("{prefix}/{{*rest}}"), any(unmatched));
    }
    router
}

async fn unmatched() -> StatusCode {
    StatusCode::NOT_FOUND
}
