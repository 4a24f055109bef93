use axum::{
    http::{HeaderValue, StatusCode, header::WWW_AUTHENTICATE},
    response::{IntoResponse, Response},
};

use crate::api_types::{ErrorCode, ErrorResponse};

/// Challenge sent with every Basic-Auth failure.
pub const BASIC_CHALLENGE: &str = r#"Basic realm="runledger", charset="UTF-8""#;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No Basic credentials on a request that needs them
    #[error("Authentication credentials required")]
    MissingCredentials,

    /// `Authorization: Basic` header that does not decode to `user:password`
    #[error("Malformed Basic authorization header")]
    MalformedCredentials,

    /// Unknown user or wrong password (generic, prevents enumeration)
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// No bearer token in the `Authorization` header or the `access_token` cookie
    #[error("Bearer token required")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Authentication token has expired")]
    ExpiredToken,

    /// The identity provider could not be reached or returned unusable keys.
    /// Callers see a plain authentication failure; the cause is only logged.
    #[error("Identity provider error: {0}")]
    IdentityProvider(String),
}

impl AuthError {
    fn is_basic(&self) -> bool {
        matches!(
            self,
            AuthError::MissingCredentials
                | AuthError::MalformedCredentials
                | AuthError::InvalidCredentials
        )
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match &self {
            AuthError::IdentityProvider(cause) => {
                tracing::warn!(error = %cause, "Rejecting request, identity provider unavailable");
                "Unable to verify credentials".to_string()
            }
            other => other.to_string(),
        };
        let challenge = if self.is_basic() {
            HeaderValue::from_static(BASIC_CHALLENGE)
        } else {
            HeaderValue::from_static("Bearer")
        };
        let mut response =
            ErrorResponse::new(ErrorCode::Unauthenticated, message).into_response();
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response.headers_mut().insert(WWW_AUTHENTICATE, challenge);
        response
    }
}
