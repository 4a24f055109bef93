use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::models::ADMIN_ROLE;

/// How callers are identified.
///
/// ```toml
/// [auth]
/// type = "users"
/// users_file = "users.yaml"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AuthConfig {
    /// No authentication. Every caller may act in every namespace.
    #[default]
    None,

    /// One shared Basic credential with unrestricted access.
    Basic(BasicAuthConfig),

    /// Per-user Basic credentials from a YAML users file. Each user is bound to the roles
    /// listed for them.
    Users(UsersAuthConfig),

    /// Bearer tokens issued by an OpenID Connect provider.
    Oidc(OidcAuthConfig),
}

impl AuthConfig {
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        match self {
            AuthConfig::None => Ok(()),
            AuthConfig::Basic(c) => c.validate(),
            AuthConfig::Users(c) => c.validate(),
            AuthConfig::Oidc(c) => c.validate(),
        }
    }

    /// Whether callers are individually identified and therefore subject to role checks.
    pub fn is_per_user(&self) -> bool {
        matches!(self, AuthConfig::Users(_) | AuthConfig::Oidc(_))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthConfig")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

impl BasicAuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(ConfigError::Validation(
                "auth.username and auth.password are required for basic auth".into(),
            ));
        }
        if self.username.contains(':') {
            return Err(ConfigError::Validation(
                "auth.username cannot contain ':'".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsersAuthConfig {
    /// Path to the YAML users file.
    pub users_file: PathBuf,
}

impl UsersAuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.users_file.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "auth.users_file cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// OIDC bearer-token validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcAuthConfig {
    /// Expected issuer (iss claim). Also the base for discovery when `jwks_url` is unset.
    pub issuer: String,

    /// Expected audience (aud claim). Can be a single value or a list.
    pub audience: OneOrMany<String>,

    /// JWKS URL. Discovered from `{issuer}/.well-known/openid-configuration` if unset.
    #[serde(default)]
    pub jwks_url: Option<String>,

    /// How often to refresh the JWKS in seconds.
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_secs: u64,

    /// Claim to use as the caller's identity.
    #[serde(default = "default_identity_claim")]
    pub identity_claim: String,

    /// Claim holding the caller's role names (string or array of strings).
    #[serde(default = "default_roles_claim")]
    pub roles_claim: String,

    /// Role name in the token that grants admin access.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,

    /// Allow expired tokens (for testing only!).
    #[serde(default)]
    pub allow_expired: bool,

    /// Allowed JWT signing algorithms.
    #[serde(default = "default_allowed_algorithms")]
    pub allowed_algorithms: Vec<JwtAlgorithm>,
}

impl OidcAuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.is_empty() {
            return Err(ConfigError::Validation("OIDC issuer cannot be empty".into()));
        }
        if self.audience.to_vec().iter().all(|a| a.is_empty()) {
            return Err(ConfigError::Validation(
                "OIDC audience cannot be empty".into(),
            ));
        }
        if matches!(&self.jwks_url, Some(url) if url.is_empty()) {
            return Err(ConfigError::Validation("JWKS URL cannot be empty".into()));
        }
        if self.identity_claim.is_empty() || self.roles_claim.is_empty() {
            return Err(ConfigError::Validation(
                "auth.identity_claim and auth.roles_claim cannot be empty".into(),
            ));
        }
        if self.admin_role.is_empty() {
            return Err(ConfigError::Validation(
                "auth.admin_role cannot be empty".into(),
            ));
        }
        if self.allowed_algorithms.is_empty() {
            return Err(ConfigError::Validation(
                "At least one JWT algorithm must be allowed".into(),
            ));
        }
        for alg in &self.allowed_algorithms {
            if matches!(
                alg,
                JwtAlgorithm::HS256 | JwtAlgorithm::HS384 | JwtAlgorithm::HS512
            ) {
                tracing::warn!(
                    algorithm = ?alg,
                    "HMAC algorithms are meant for shared secrets; prefer RS256 or ES256 with an identity provider"
                );
            }
        }
        if self.allow_expired {
            tracing::warn!("auth.allow_expired is set; expired OIDC tokens will be accepted");
        }
        Ok(())
    }

    /// Map a role name from the token to the stored role name it stands for.
    pub fn normalize_role<'a>(&self, role: &'a str) -> &'a str {
        if role == self.admin_role {
            ADMIN_ROLE
        } else {
            role
        }
    }
}

/// JWT signing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JwtAlgorithm {
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    PS256,
    PS384,
    PS512,
    EdDSA,
}

impl JwtAlgorithm {
    /// Convert to jsonwebtoken Algorithm.
    pub fn to_jwt_algorithm(self) -> jsonwebtoken::Algorithm {
        match self {
            JwtAlgorithm::HS256 => jsonwebtoken::Algorithm::HS256,
            JwtAlgorithm::HS384 => jsonwebtoken::Algorithm::HS384,
            JwtAlgorithm::HS512 => jsonwebtoken::Algorithm::HS512,
            JwtAlgorithm::RS256 => jsonwebtoken::Algorithm::RS256,
            JwtAlgorithm::RS384 => jsonwebtoken::Algorithm::RS384,
            JwtAlgorithm::RS512 => jsonwebtoken::Algorithm::RS512,
            JwtAlgorithm::ES256 => jsonwebtoken::Algorithm::ES256,
            JwtAlgorithm::ES384 => jsonwebtoken::Algorithm::ES384,
            JwtAlgorithm::PS256 => jsonwebtoken::Algorithm::PS256,
            JwtAlgorithm::PS384 => jsonwebtoken::Algorithm::PS384,
            JwtAlgorithm::PS512 => jsonwebtoken::Algorithm::PS512,
            JwtAlgorithm::EdDSA => jsonwebtoken::Algorithm::EdDSA,
        }
    }

    pub fn matches(self, alg: jsonwebtoken::Algorithm) -> bool {
        self.to_jwt_algorithm() == alg
    }
}

fn default_allowed_algorithms() -> Vec<JwtAlgorithm> {
    vec![
        JwtAlgorithm::RS256,
        JwtAlgorithm::RS384,
        JwtAlgorithm::RS512,
        JwtAlgorithm::ES256,
        JwtAlgorithm::ES384,
    ]
}

fn default_jwks_refresh() -> u64 {
    3600 // 1 hour
}

fn default_identity_claim() -> String {
    "sub".to_string()
}

fn default_roles_claim() -> String {
    "roles".to_string()
}

fn default_admin_role() -> String {
    ADMIN_ROLE.to_string()
}

/// A value that can be either a single item or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}
