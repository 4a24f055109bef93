//! OIDC bearer-token validation against the identity provider's JWKS.
//!
//! Keys are cached and refreshed every `jwks_refresh_secs`, or immediately when a token
//! names a key ID the cache does not hold (key rotation).

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use jsonwebtoken::{
    DecodingKey, TokenData, Validation, decode, decode_header,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
};
use serde::Deserialize;
use tokio::sync::{OnceCell, RwLock};

use super::{AuthError, Identity, discovery};
use crate::config::OidcAuthConfig;

/// Claims of a validated token. Everything beyond `sub` and `email` is kept for the
/// configurable identity and roles claims.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtClaims {
    pub sub: String,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl JwtClaims {
    fn claim_str(&self, name: &str) -> Option<&str> {
        match name {
            "sub" => Some(self.sub.as_str()),
            "email" => self.email.as_deref(),
            _ => self.extra.get(name).and_then(|v| v.as_str()),
        }
    }

    /// A claim holding either one string or an array of strings.
    fn claim_strings(&self, name: &str) -> Vec<String> {
        match self.extra.get(name) {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }
}

struct CachedJwks {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// Validates bearer tokens and turns them into identities.
pub struct JwtValidator {
    config: OidcAuthConfig,
    http_client: reqwest::Client,
    jwks_url: OnceCell<String>,
    jwks_cache: RwLock<Option<CachedJwks>>,
}

impl JwtValidator {
    pub fn new(config: OidcAuthConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: OidcAuthConfig, http_client: reqwest::Client) -> Self {
        let jwks_url = match &config.jwks_url {
            Some(url) => OnceCell::new_with(Some(url.clone())),
            None => OnceCell::new(),
        };
        Self {
            config,
            http_client,
            jwks_url,
            jwks_cache: RwLock::new(None),
        }
    }

    /// Fetch the key set ahead of the first request.
    pub async fn prefetch(&self) -> Result<(), AuthError> {
        self.refresh_jwks().await
    }

    /// Validate a token and build the caller's identity from its claims.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.validate(token).await?;

        let subject = claims
            .claim_str(&self.config.identity_claim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                tracing::debug!(
                    claim = %self.config.identity_claim,
                    "Token lacks the configured identity claim"
                );
                AuthError::InvalidToken
            })?
            .to_string();

        let roles = claims
            .claim_strings(&self.config.roles_claim)
            .iter()
            .map(|role| self.config.normalize_role(role).to_string())
            .collect();

        Ok(Identity::Oidc {
            subject,
            email: claims.email,
            roles,
        })
    }

    /// Validate signature, issuer, audience and expiry.
    pub async fn validate(&self, token: &str) -> Result<JwtClaims, AuthError> {
        let header = decode_header(token).map_err(|e| {
            tracing::debug!(error = %e, "Failed to decode JWT header");
            AuthError::InvalidToken
        })?;

        // Reject anything outside the allowlist before a key is even looked up
        if !self
            .config
            .allowed_algorithms
            .iter()
            .any(|allowed| allowed.matches(header.alg))
        {
            tracing::warn!(algorithm = ?header.alg, "JWT algorithm not in allowlist");
            return Err(AuthError::InvalidToken);
        }

        let kid = header.kid.as_ref().ok_or_else(|| {
            tracing::debug!("JWT missing key ID (kid)");
            AuthError::InvalidToken
        })?;

        let decoding_key = self.get_decoding_key(kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&self.config.audience.to_vec());
        if self.config.allow_expired {
            validation.validate_exp = false;
        }

        let token_data: TokenData<JwtClaims> =
            decode(token, &decoding_key, &validation).map_err(|e| {
                tracing::debug!(error = %e, "JWT validation failed");
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                    _ => AuthError::InvalidToken,
                }
            })?;

        Ok(token_data.claims)
    }

    async fn get_decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                let refresh_after = Duration::from_secs(self.config.jwks_refresh_secs);
                if cached.fetched_at.elapsed() < refresh_after
                    && let Some(key) = cached.keys.get(kid)
                {
                    return Ok(key.clone());
                }
            }
        }

        self.refresh_jwks().await?;

        let cache = self.jwks_cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or_else(|| {
                tracing::warn!(kid = kid, "Key ID not found in JWKS");
                AuthError::InvalidToken
            })
    }

    async fn jwks_url(&self) -> Result<&str, AuthError> {
        self.jwks_url
            .get_or_try_init(|| discovery::fetch_jwks_uri(&self.config.issuer, &self.http_client))
            .await
            .map(String::as_str)
    }

    async fn refresh_jwks(&self) -> Result<(), AuthError> {
        let url = self.jwks_url().await?;
        tracing::debug!(url = %url, "Fetching JWKS");

        let response = self.http_client.get(url).send().await.map_err(|e| {
            tracing::error!(error = %e, url = %url, "Failed to fetch JWKS");
            AuthError::IdentityProvider(format!("Failed to fetch JWKS: {e}"))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, url = %url, "JWKS endpoint returned error");
            return Err(AuthError::IdentityProvider(format!(
                "JWKS endpoint returned {status}"
            )));
        }

        let jwks: JwkSet = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse JWKS response");
            AuthError::IdentityProvider(format!("Failed to parse JWKS: {e}"))
        })?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(kid) = &jwk.common.key_id {
                match jwk_to_decoding_key(&jwk) {
                    Ok(key) => {
                        keys.insert(kid.clone(), key);
                    }
                    Err(e) => {
                        tracing::warn!(kid = kid, error = %e, "Failed to convert JWK to decoding key");
                    }
                }
            }
        }

        tracing::info!(keys_count = keys.len(), "JWKS refreshed");

        *self.jwks_cache.write().await = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, AuthError> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map_err(|e| AuthError::IdentityProvider(format!("Failed to create RSA decoding key: {e}"))),
        AlgorithmParameters::EllipticCurve(ec) => {
            use jsonwebtoken::jwk::KeyAlgorithm;

            match jwk.common.key_algorithm {
                Some(KeyAlgorithm::ES256) | Some(KeyAlgorithm::ES384) | None => {
                    DecodingKey::from_ec_components(&ec.x, &ec.y).map_err(|e| {
                        AuthError::IdentityProvider(format!("Failed to create EC decoding key: {e}"))
                    })
                }
                Some(alg) => Err(AuthError::IdentityProvider(format!(
                    "Unsupported EC algorithm: {alg:?}"
                ))),
            }
        }
        AlgorithmParameters::OctetKey(oct) => DecodingKey::from_base64_secret(&oct.value)
            .map_err(|e| AuthError::IdentityProvider(format!("Failed to create HMAC decoding key: {e}"))),
        _ => Err(AuthError::IdentityProvider(
            "Unsupported JWK algorithm type".to_string(),
        )),
    }
}
