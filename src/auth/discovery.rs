//! OIDC discovery: locate the JWKS endpoint from the issuer.

use super::AuthError;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Minimal OIDC discovery document, only the field we need.
#[derive(serde::Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

/// Fetch the `jwks_uri` advertised at `{issuer}/.well-known/openid-configuration`.
pub async fn fetch_jwks_uri(
    issuer: &str,
    http_client: &reqwest::Client,
) -> Result<String, AuthError> {
    let url = if issuer.ends_with(DISCOVERY_PATH) {
        issuer.to_string()
    } else {
        format!("{}{DISCOVERY_PATH}", issuer.trim_end_matches('/'))
    };

    tracing::debug!(url = %url, "Fetching OIDC discovery for JWKS URI");

    let response = http_client
        .get(&url)
        .send()
        .await
        .map_err(|e| AuthError::IdentityProvider(format!("Failed to fetch OIDC discovery: {e}")))?;

    if !response.status().is_success() {
        return Err(AuthError::IdentityProvider(format!(
            "OIDC discovery returned {}",
            response.status()
        )));
    }

    let doc: DiscoveryDocument = response
        .json()
        .await
        .map_err(|e| AuthError::IdentityProvider(format!("Failed to parse OIDC discovery: {e}")))?;

    if !(doc.jwks_uri.starts_with("https://") || doc.jwks_uri.starts_with("http://")) {
        return Err(AuthError::IdentityProvider(format!(
            "OIDC discovery returned a non-HTTP jwks_uri: {}",
            doc.jwks_uri
        )));
    }

    Ok(doc.jwks_uri)
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    #[tokio::test]
    async fn test_fetches_jwks_uri() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": server.uri(),
                "jwks_uri": format!("{}/certs", server.uri()),
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let uri = fetch_jwks_uri(&format!("{}/", server.uri()), &client)
            .await
            .unwrap();
        assert_eq!(uri, format!("{}/certs", server.uri()));
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = fetch_jwks_uri(&server.uri(), &reqwest::Client::new()).await;
        assert!(matches!(result, Err(AuthError::IdentityProvider(_))));
    }

    #[tokio::test]
    async fn test_rejects_non_http_jwks_uri() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"jwks_uri": "file:///etc/passwd"})),
            )
            .mount(&server)
            .await;

        let result = fetch_jwks_uri(&server.uri(), &reqwest::Client::new()).await;
        assert!(matches!(result, Err(AuthError::IdentityProvider(_))));
    }
}
