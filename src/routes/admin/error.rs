use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{db::DbError, services::NamespaceError};

/// Body of every admin API error.
#[derive(Debug, Serialize)]
pub struct AdminErrorBody {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub enum AdminError {
    NotFound(String),
    Conflict(String),
    Validation(String),
    BadRequest(String),
    Forbidden(String),
    Database(DbError),
}

impl From<DbError> for AdminError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => AdminError::NotFound("Resource not found".to_string()),
            DbError::Conflict(msg) => AdminError::Conflict(msg),
            _ => AdminError::Database(err),
        }
    }
}

impl From<NamespaceError> for AdminError {
    fn from(err: NamespaceError) -> Self {
        match err {
            NamespaceError::InvalidCode | NamespaceError::CodeInUse => {
                AdminError::Validation(err.to_string())
            }
            NamespaceError::InvalidInput(msg) => AdminError::Validation(msg),
            NamespaceError::NotFound(_) => AdminError::NotFound(err.to_string()),
            NamespaceError::Database(db_err) => db_err.into(),
        }
    }
}

impl From<JsonRejection> for AdminError {
    fn from(rejection: JsonRejection) -> Self {
        AdminError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdminError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AdminError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AdminError::Validation(msg) | AdminError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, msg)
            }
            AdminError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AdminError::Database(err) => {
                tracing::error!(error = %err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal database error occurred".to_string(),
                )
            }
        };

        (
            status,
            Json(AdminErrorBody {
                status: "error",
                message,
            }),
        )
            .into_response()
    }
}
