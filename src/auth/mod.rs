//! Caller identification.
//!
//! The configured [`AuthMode`] is resolved once at startup and turns each request's
//! credentials into an [`Identity`]. Deciding what that identity may do is left to the
//! role cache and the authorization middleware.

mod basic;
mod discovery;
mod error;
mod identity;
pub mod jwt;
mod users_file;

use std::sync::Arc;

pub use basic::{BasicCredentials, parse_basic};
pub use error::{AuthError, BASIC_CHALLENGE};
use http::{HeaderMap, header::AUTHORIZATION};
pub use identity::Identity;
pub use jwt::JwtValidator;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tower_cookies::Cookies;
pub use users_file::{UserDirectory, UserRecord, UsersFileError};

use crate::config::{AuthConfig, BasicAuthConfig};

/// Cookie that browser sessions use to carry an OIDC bearer token.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Configured authentication mode.
#[derive(Clone)]
pub enum AuthMode {
    Disabled,
    SharedBasic(Arc<BasicAuthConfig>),
    Users(Arc<UserDirectory>),
    Oidc(Arc<JwtValidator>),
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl AuthMode {
    /// Build the mode from configuration, loading the users file if one is configured.
    pub fn from_config(config: &AuthConfig) -> Result<Self, UsersFileError> {
        Ok(match config {
            AuthConfig::None => AuthMode::Disabled,
            AuthConfig::Basic(basic) => AuthMode::SharedBasic(Arc::new(basic.clone())),
            AuthConfig::Users(users) => {
                let directory = UserDirectory::load(&users.users_file)?;
                tracing::info!(
                    path = %users.users_file.display(),
                    users = directory.len(),
                    "Loaded users file"
                );
                AuthMode::Users(Arc::new(directory))
            }
            AuthConfig::Oidc(oidc) => AuthMode::Oidc(Arc::new(JwtValidator::new(oidc.clone()))),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMode::Disabled => "none",
            AuthMode::SharedBasic(_) => "basic",
            AuthMode::Users(_) => "users",
            AuthMode::Oidc(_) => "oidc",
        }
    }

    /// Whether identities from this mode are checked against role bindings.
    pub fn is_per_user(&self) -> bool {
        matches!(self, AuthMode::Users(_) | AuthMode::Oidc(_))
    }

    /// Identify the caller from request headers and, for OIDC, the `access_token` cookie.
    pub async fn identify(
        &self,
        headers: &HeaderMap,
        cookies: Option<&Cookies>,
    ) -> Result<Identity, AuthError> {
        match self {
            AuthMode::Disabled => Ok(Identity::Anonymous),
            AuthMode::SharedBasic(config) => {
                let creds = parse_basic(headers)?.ok_or(AuthError::MissingCredentials)?;
                if shared_credentials_match(config, &creds) {
                    Ok(Identity::SharedBasic {
                        username: creds.username,
                    })
                } else {
                    Err(AuthError::InvalidCredentials)
                }
            }
            AuthMode::Users(directory) => {
                let creds = parse_basic(headers)?.ok_or(AuthError::MissingCredentials)?;
                directory.authenticate(&creds.username, &creds.password)
            }
            AuthMode::Oidc(validator) => {
                let token = bearer_token(headers)
                    .or_else(|| {
                        cookies
                            .and_then(|c| c.get(ACCESS_TOKEN_COOKIE))
                            .map(|c| c.value().to_string())
                    })
                    .filter(|t| !t.is_empty())
                    .ok_or(AuthError::MissingToken)?;
                validator.authenticate(&token).await
            }
        }
    }
}

fn shared_credentials_match(config: &BasicAuthConfig, creds: &BasicCredentials) -> bool {
    let digest = |s: &str| -> [u8; 32] { Sha256::digest(s.as_bytes()).into() };
    let user_ok = digest(&config.username).ct_eq(&digest(&creds.username));
    let password_ok = digest(&config.password).ct_eq(&digest(&creds.password));
    (user_ok & password_ok).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
}
