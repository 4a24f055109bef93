//! Router-level scenarios: authorization, existence hiding, revocation and namespace
//! administration through the full middleware stack.

use axum::{Router, body::Body};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use super::fixtures::{Fixture, users_mode};
use crate::{auth::AuthMode, build_app, config::RunledgerConfig};

fn basic(user: &str) -> String {
    let password = format!("{user}password");
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(header::AUTHORIZATION, basic(user));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn scenario_app() -> (Fixture, Router) {
    let fixture = Fixture::scenario().await;
    let app = build_app(&RunledgerConfig::default(), fixture.app_state(users_mode()));
    (fixture, app)
}

fn codes(body: &Value) -> Vec<String> {
    body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|ns| ns["code"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_user_scenario() {
    let (_fixture, app) = scenario_app().await;

    let (status, body) = send(&app, "GET", "/ns/ns1/chooser/namespaces/current", Some("user1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["namespace"]["code"], "ns1");
    assert_eq!(body["permission"], "read_write");
    assert_eq!(body["is_admin"], false);

    let (status, body) = send(&app, "GET", "/ns/ns3/chooser/namespaces/current", Some("user1"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        json!({
            "error_code": "RESOURCE_DOES_NOT_EXIST",
            "message": "unable to find namespace with code: ns3"
        })
    );

    let (status, body) = send(&app, "GET", "/ns/ns3/chooser/namespaces/current", Some("user3"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_admin"], true);
}

#[tokio::test]
async fn test_chooser_lists_only_permitted_namespaces() {
    let (_fixture, app) = scenario_app().await;

    let (_, body) = send(&app, "GET", "/ns/ns2/chooser/namespaces", Some("user2"), None).await;
    assert_eq!(codes(&body), vec!["ns2", "ns3"]);

    let (_, body) = send(&app, "GET", "/ns/ns1/chooser/namespaces", Some("user3"), None).await;
    assert_eq!(codes(&body), vec!["default", "ns1", "ns2", "ns3"]);
}

#[tokio::test]
async fn test_existence_hiding_is_exact() {
    let (fixture, app) = scenario_app().await;
    fixture.create_namespace("private").await;

    let hidden = send(&app, "GET", "/ns/private/chooser/namespaces", Some("user1"), None).await;
    let missing = send(&app, "GET", "/ns/nowhere/chooser/namespaces", Some("user1"), None).await;

    assert_eq!(hidden.0, missing.0);
    assert_eq!(hidden.1["error_code"], missing.1["error_code"]);
    assert_eq!(
        hidden.1["message"].as_str().unwrap().replace("private", "X"),
        missing.1["message"].as_str().unwrap().replace("nowhere", "X"),
    );
}

#[tokio::test]
async fn test_business_prefixes_are_gated_then_unmatched() {
    let (_fixture, app) = scenario_app().await;

    // Authorized but nothing is mounted here
    let (status, _) = send(&app, "GET", "/ns/ns1/aim/api/projects", Some("user1"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Unauthorized: rejected by the middleware with the JSON payload
    let (status, body) = send(&app, "POST", "/ns/ns3/api/2.0/mlflow/runs/create", Some("user1"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "RESOURCE_DOES_NOT_EXIST");

    // Missing credentials on an existing namespace
    let (status, body) = send(&app, "GET", "/api/2.0/mlflow/experiments/list", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_revocation_rejects_subsequent_requests() {
    let (fixture, app) = scenario_app().await;
    let uri = "/ns/ns2/chooser/namespaces/current";

    let (status, _) = send(&app, "GET", uri, Some("user2"), None).await;
    assert_eq!(status, StatusCode::OK);

    fixture.db.roles().remove_user("ns:ns2", "user2").await.unwrap();
    let user2 = crate::auth::Identity::User {
        name: "user2".into(),
    };
    fixture
        .eventually(|| fixture.roles.permission_for(&user2, "ns2").is_none())
        .await;

    let (status, body) = send(&app, "GET", uri, Some("user2"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "unable to find namespace with code: ns2");
}

#[tokio::test]
async fn test_admin_routes_require_admin() {
    let (_fixture, app) = scenario_app().await;

    // user1 has no grant on `default`, which must not matter here
    let (status, body) = send(&app, "GET", "/admin/namespaces", Some("user1"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"status": "error", "message": "admin access required"}));

    let (status, body) = send(&app, "GET", "/admin/namespaces", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "UNAUTHENTICATED");

    let (status, body) = send(&app, "GET", "/admin/namespaces", Some("user3"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(codes(&body), vec!["default", "ns1", "ns2", "ns3"]);
}

#[tokio::test]
async fn test_temp_namespace_create_and_conflicting_rename() {
    let (fixture, app) = scenario_app().await;

    let (status, created) = send(
        &app,
        "POST",
        "/admin/namespaces",
        Some("user3"),
        Some(json!({"code": "temp", "description": "scratch"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_i64().unwrap();

    // Visible straight away through the namespace middleware
    let (status, body) = send(&app, "GET", "/ns/temp/chooser/namespaces/current", Some("user3"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["namespace"]["id"], id);

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/admin/namespaces/{id}"),
        Some("user3"),
        Some(json!({"code": "ns1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"status": "error", "message": "The namespace code is already in use."})
    );

    assert_eq!(fixture.namespaces.get_by_id(id).unwrap().code, "temp");
    let (_, body) = send(&app, "GET", &format!("/admin/namespaces/{id}"), Some("user3"), None).await;
    assert_eq!(body["code"], "temp");
    assert_eq!(body["description"], "scratch");
}

#[tokio::test]
async fn test_admin_validation_and_unknown_id() {
    let (_fixture, app) = scenario_app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/admin/namespaces",
        Some("user3"),
        Some(json!({"code": "bad code"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "The namespace code is invalid.");

    let (status, body) = send(&app, "GET", "/admin/namespaces/4242", Some("user3"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "namespace not found by id: 4242");

    let (status, body) = send(&app, "POST", "/admin/namespaces", Some("user3"), Some(json!({"nope": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_disabled_auth_is_unrestricted() {
    let fixture = Fixture::scenario().await;
    let app = build_app(&RunledgerConfig::default(), fixture.app_state(AuthMode::Disabled));

    let (status, body) = send(&app, "GET", "/ns/ns3/chooser/namespaces/current", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["identity"], json!({"kind": "anonymous"}));

    let (status, _) = send(&app, "GET", "/admin/namespaces", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_echoed_on_rejections() {
    let (_fixture, app) = scenario_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/ns/missing/chooser/namespaces")
                .header("x-request-id", "trace-me")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-request-id"], "trace-me");
}

#[tokio::test]
async fn test_identity_provider_outage_is_unauthenticated() {
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use crate::{
        auth::JwtValidator,
        config::{JwtAlgorithm, OidcAuthConfig, OneOrMany},
    };

    let idp = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&idp)
        .await;

    let validator = JwtValidator::new(OidcAuthConfig {
        issuer: idp.uri(),
        audience: OneOrMany::One("runledger".to_string()),
        jwks_url: Some(format!("{}/jwks", idp.uri())),
        jwks_refresh_secs: 3600,
        identity_claim: "sub".to_string(),
        roles_claim: "roles".to_string(),
        admin_role: "admin".to_string(),
        allow_expired: false,
        allowed_algorithms: vec![JwtAlgorithm::RS256],
    });
    let fixture = Fixture::scenario().await;
    let app = build_app(
        &RunledgerConfig::default(),
        fixture.app_state(AuthMode::Oidc(std::sync::Arc::new(validator))),
    );

    let mut token_header = Header::new(Algorithm::RS256);
    token_header.kid = Some("test-key".to_string());
    let key = EncodingKey::from_rsa_pem(include_bytes!("../auth/testdata/rsa_private.pem"))
        .unwrap();
    let token = encode(
        &token_header,
        &json!({"sub": "alice", "iss": idp.uri(), "aud": "runledger", "exp": 4_102_444_800u64}),
        &key,
    )
    .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ns/ns1/chooser/namespaces/current")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error_code"], "UNAUTHENTICATED");
    assert!(!body["message"].as_str().unwrap().contains("503"));
}
