mod error;
pub mod namespaces;

use axum::{Router, routing::get};
pub use error::{AdminError, AdminErrorBody};

use crate::AppState;

/// Admin routes. Authorization and the admin requirement are layered on in `build_app`.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/namespaces",
            get(namespaces::list).post(namespaces::create),
        )
        .route(
            "/namespaces/{id}",
            get(namespaces::get).put(namespaces::update),
        )
}
