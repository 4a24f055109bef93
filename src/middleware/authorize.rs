//! Namespace resolution and per-request authorization.
//!
//! Every namespace-scoped request passes through [`namespace_auth_middleware`]:
//!
//! 1. The namespace code is taken from a `/ns/{code}` path prefix, or is `default`.
//!    An unknown code is rejected before credentials are looked at.
//! 2. The caller is identified by the configured [`AuthMode`].
//! 3. Per-user identities must be admin or hold a role granting the namespace. A miss
//!    is answered exactly like an unknown namespace.
//!
//! On success a [`NamespaceContext`] is added to the request extensions. Its
//! `permission` is informational here: handlers that write must refuse callers holding
//! only [`PermissionLevel::ReadOnly`] themselves.
//!
//! Admin routes are not namespace-scoped. [`admin_auth_middleware`] identifies the
//! caller and checks the admin role only, then adds an [`AdminContext`].

use std::sync::Arc;

use axum::{
    extract::{FromRef, OriginalUri, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_cookies::Cookies;

use crate::{
    AppState,
    api_types::ErrorResponse,
    auth::{AuthError, AuthMode, Identity},
    cache::{CachedNamespaceRepo, CachedRoleRepo, PermittedNamespaces},
    models::{DEFAULT_NAMESPACE_CODE, Namespace, PermissionLevel},
    routes::admin::AdminError,
};

/// Path prefix that selects a namespace other than `default`.
pub const NAMESPACE_PATH_PREFIX: &str = "/ns/";

/// Outcome of a successful authorization, available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct NamespaceContext {
    pub namespace: Arc<Namespace>,
    pub identity: Identity,
    pub permission: PermissionLevel,
}

/// Caller of an admin route, available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct AdminContext {
    pub identity: Identity,
}

/// Why a request was turned away. Both variants end the request.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    /// Unknown namespace, or one the caller may not see.
    #[error("unable to find namespace with code: {0}")]
    NamespaceNotFound(String),

    #[error(transparent)]
    Unauthenticated(#[from] AuthError),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::NamespaceNotFound(code) => {
                ErrorResponse::namespace_not_found(&code).into_response()
            }
            Rejection::Unauthenticated(e) => e.into_response(),
        }
    }
}

/// Namespace code addressed by a request path.
pub fn namespace_code_from_path(path: &str) -> &str {
    match path.strip_prefix(NAMESPACE_PATH_PREFIX) {
        Some(rest) => rest.split('/').next().unwrap_or_default(),
        None => DEFAULT_NAMESPACE_CODE,
    }
}

/// Resolves namespaces and decides whether a caller may act in them.
#[derive(Clone)]
pub struct Authorizer {
    namespaces: Arc<CachedNamespaceRepo>,
    roles: Arc<CachedRoleRepo>,
    auth: AuthMode,
}

impl FromRef<AppState> for Authorizer {
    fn from_ref(state: &AppState) -> Self {
        state.authorizer.clone()
    }
}

impl Authorizer {
    pub fn new(
        namespaces: Arc<CachedNamespaceRepo>,
        roles: Arc<CachedRoleRepo>,
        auth: AuthMode,
    ) -> Self {
        Self {
            namespaces,
            roles,
            auth,
        }
    }

    pub fn auth_mode(&self) -> &AuthMode {
        &self.auth
    }

    pub fn namespaces(&self) -> &Arc<CachedNamespaceRepo> {
        &self.namespaces
    }

    /// Look a namespace up by code. Served from memory.
    pub fn resolve_namespace(&self, code: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get_by_code(code)
    }

    /// Namespaces the identity may see. Unrestricted for the non-per-user modes.
    pub fn permitted_namespaces(&self, identity: &Identity) -> PermittedNamespaces {
        if self.auth.is_per_user() {
            self.roles.get_permitted_namespaces(identity)
        } else {
            PermittedNamespaces::All
        }
    }

    pub fn is_admin(&self, identity: &Identity) -> bool {
        !self.auth.is_per_user() || self.roles.is_admin(identity)
    }

    /// Identify the caller with the configured mode. No namespace is involved.
    pub async fn identify(&self, parts: &Parts) -> Result<Identity, AuthError> {
        self.auth
            .identify(&parts.headers, parts.extensions.get::<Cookies>())
            .await
            .inspect_err(|e| {
                tracing::debug!(mode = self.auth.name(), error = %e, "Authentication failed");
            })
    }

    /// Resolve the namespace, identify the caller and check their access.
    pub async fn authorize(&self, parts: &Parts) -> Result<NamespaceContext, Rejection> {
        let path = parts
            .extensions
            .get::<OriginalUri>()
            .map(|uri| uri.path())
            .unwrap_or_else(|| parts.uri.path());
        let code = namespace_code_from_path(path);

        let namespace = self
            .resolve_namespace(code)
            .ok_or_else(|| Rejection::NamespaceNotFound(code.to_string()))?;

        let identity = self.identify(parts).await?;

        let permission = if self.auth.is_per_user() {
            self.roles
                .permission_for(&identity, &namespace.code)
                .ok_or_else(|| {
                    tracing::debug!(
                        principal = identity.principal(),
                        namespace = %namespace.code,
                        "Caller holds no role for namespace"
                    );
                    Rejection::NamespaceNotFound(code.to_string())
                })?
        } else {
            PermissionLevel::ReadWrite
        };

        Ok(NamespaceContext {
            namespace,
            identity,
            permission,
        })
    }
}

/// Gate for every namespace-scoped route.
pub async fn namespace_auth_middleware(
    State(authorizer): State<Authorizer>,
    req: Request,
    next: Next,
) -> Result<Response, Rejection> {
    let (mut parts, body) = req.into_parts();
    let context = authorizer.authorize(&parts).await?;

    tracing::debug!(
        namespace = %context.namespace.code,
        principal = context.identity.principal(),
        kind = context.identity.kind(),
        permission = %context.permission,
        "Request authorized"
    );

    parts.extensions.insert(context);
    Ok(next.run(Request::from_parts(parts, body)).await)
}

/// Gate for the admin API: authenticated admins only, whatever their namespace grants.
pub async fn admin_auth_middleware(
    State(authorizer): State<Authorizer>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let (mut parts, body) = req.into_parts();
    let identity = authorizer
        .identify(&parts)
        .await
        .map_err(IntoResponse::into_response)?;

    if !authorizer.is_admin(&identity) {
        tracing::info!(
            principal = identity.principal(),
            "Non-admin caller refused on admin route"
        );
        return Err(AdminError::Forbidden("admin access required".to_string()).into_response());
    }

    parts.extensions.insert(AdminContext { identity });
    Ok(next.run(Request::from_parts(parts, body)).await)
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use axum::body::Body;
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use http::{Request as HttpRequest, StatusCode};
    use rstest::rstest;

    use super::*;
    use crate::tests::fixtures::{Fixture, users_mode};

    fn parts(uri: &str, user: Option<(&str, &str)>) -> Parts {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some((name, password)) = user {
            let value = format!("Basic {}", STANDARD.encode(format!("{name}:{password}")));
            builder = builder.header(http::header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[rstest]
    #[case("/api/2.0/mlflow/runs/get", "default")]
    #[case("/ns/team-a/api/2.0/mlflow/runs/get", "team-a")]
    #[case("/ns/team-a", "team-a")]
    #[case("/ns//aim/api/projects", "")]
    #[case("/nsx/aim", "default")]
    fn test_namespace_code_from_path(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(namespace_code_from_path(path), expected);
    }

    #[tokio::test]
    async fn test_scenario_user_access() {
        let fixture = Fixture::scenario().await;
        let authorizer = fixture.authorizer(users_mode());

        let ok = authorizer
            .authorize(&parts("/ns/ns1/aim/api/projects", Some(("user1", "user1password"))))
            .await
            .unwrap();
        assert_eq!(ok.namespace.code, "ns1");
        assert_eq!(ok.permission, PermissionLevel::ReadWrite);

        let denied = authorizer
            .authorize(&parts("/ns/ns3/aim/api/projects", Some(("user1", "user1password"))))
            .await
            .unwrap_err();
        assert_eq!(
            denied.to_string(),
            "unable to find namespace with code: ns3"
        );

        let admin = authorizer
            .authorize(&parts("/ns/ns3/aim/api/projects", Some(("user3", "user3password"))))
            .await
            .unwrap();
        assert_eq!(admin.namespace.code, "ns3");
    }

    #[tokio::test]
    async fn test_unknown_namespace_rejected_before_auth() {
        let fixture = Fixture::scenario().await;
        let authorizer = fixture.authorizer(users_mode());

        // No credentials at all, yet the answer is "does not exist" rather than 401
        let rejection = authorizer
            .authorize(&parts("/ns/missing/aim/api/projects", None))
            .await
            .unwrap_err();
        assert!(matches!(rejection, Rejection::NamespaceNotFound(code) if code == "missing"));
    }

    #[tokio::test]
    async fn test_hidden_and_missing_namespaces_answer_identically() {
        let fixture = Fixture::scenario().await;
        fixture.create_namespace("secret").await;
        let authorizer = fixture.authorizer(users_mode());
        let creds = Some(("user1", "user1password"));

        let hidden = authorizer
            .authorize(&parts("/ns/secret/x", creds))
            .await
            .unwrap_err()
            .into_response();
        let missing = authorizer
            .authorize(&parts("/ns/nothing/x", creds))
            .await
            .unwrap_err()
            .into_response();

        assert_eq!(hidden.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let body = |r: Response| async move {
            let bytes = axum::body::to_bytes(r.into_body(), usize::MAX).await.unwrap();
            serde_json::from_slice::<serde_json::Value>(&bytes).unwrap()
        };
        let hidden = body(hidden).await;
        let missing = body(missing).await;
        assert_eq!(hidden["error_code"], missing["error_code"]);
        assert_eq!(hidden["message"], "unable to find namespace with code: secret");
        assert_eq!(missing["message"], "unable to find namespace with code: nothing");
    }

    #[tokio::test]
    async fn test_bad_password_is_unauthenticated() {
        let fixture = Fixture::scenario().await;
        let authorizer = fixture.authorizer(users_mode());

        let rejection = authorizer
            .authorize(&parts("/ns/ns1/x", Some(("user1", "nope"))))
            .await
            .unwrap_err();
        assert!(matches!(
            rejection,
            Rejection::Unauthenticated(AuthError::InvalidCredentials)
        ));
        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(http::header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_disabled_auth_allows_everything() {
        let fixture = Fixture::scenario().await;
        let authorizer = fixture.authorizer(AuthMode::Disabled);

        let context = authorizer.authorize(&parts("/ns/ns2/x", None)).await.unwrap();
        assert_eq!(context.identity, Identity::Anonymous);
        assert_eq!(context.permission, PermissionLevel::ReadWrite);
        assert!(authorizer.is_admin(&context.identity));
        assert_eq!(
            authorizer.permitted_namespaces(&context.identity),
            PermittedNamespaces::All
        );
    }

    #[tokio::test]
    async fn test_root_paths_use_default_namespace() {
        let fixture = Fixture::scenario().await;
        let authorizer = fixture.authorizer(AuthMode::Disabled);

        let context = authorizer
            .authorize(&parts("/api/2.0/mlflow/experiments/list", None))
            .await
            .unwrap();
        assert!(context.namespace.is_default());
    }

    #[tokio::test]
    async fn test_revoked_binding_rejects_next_request() {
        let fixture = Fixture::scenario().await;
        let authorizer = fixture.authorizer(users_mode());
        let creds = Some(("user1", "user1password"));
        assert!(authorizer.authorize(&parts("/ns/ns1/x", creds)).await.is_ok());

        fixture
            .db
            .roles()
            .remove_user("ns:ns1", "user1")
            .await
            .unwrap();
        let user1 = Identity::User {
            name: "user1".into(),
        };
        fixture
            .eventually(|| fixture.roles.permission_for(&user1, "ns1").is_none())
            .await;

        let rejection = authorizer
            .authorize(&parts("/ns/ns1/x", creds))
            .await
            .unwrap_err();
        assert!(matches!(rejection, Rejection::NamespaceNotFound(_)));
    }

    #[tokio::test]
    async fn test_middleware_inserts_context() {
        use axum::{Extension, Router, middleware, routing::get};
        use tower::ServiceExt;

        let fixture = Fixture::scenario().await;
        let authorizer = fixture.authorizer(AuthMode::Disabled);
        let app = Router::new()
            .route(
                "/whoami",
                get(|Extension(ctx): Extension<NamespaceContext>| async move {
                    ctx.namespace.code.clone()
                }),
            )
            .layer(middleware::from_fn_with_state(
                authorizer.clone(),
                namespace_auth_middleware,
            ))
            .with_state(authorizer);

        let response = app
            .oneshot(HttpRequest::builder().uri("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"default");
    }

    async fn admin_gate_status(fixture: &Fixture, user: Option<(&str, &str)>) -> StatusCode {
        use axum::{Extension, Router, middleware, routing::get};
        use tower::ServiceExt;

        let authorizer = fixture.authorizer(users_mode());
        let app = Router::new()
            .route(
                "/admin/ping",
                get(|Extension(ctx): Extension<AdminContext>| async move {
                    ctx.identity.principal().to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(
                authorizer.clone(),
                admin_auth_middleware,
            ))
            .with_state(authorizer);

        let mut builder = HttpRequest::builder().uri("/admin/ping");
        if let Some((name, password)) = user {
            let value = format!("Basic {}", STANDARD.encode(format!("{name}:{password}")));
            builder = builder.header(http::header::AUTHORIZATION, value);
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_admin_gate_ignores_namespace_grants() {
        let fixture = Fixture::scenario().await;

        // user1 holds no role on `default`; the admin check alone decides
        assert_eq!(
            admin_gate_status(&fixture, Some(("user1", "user1password"))).await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            admin_gate_status(&fixture, Some(("user3", "user3password"))).await,
            StatusCode::OK
        );
        assert_eq!(
            admin_gate_status(&fixture, Some(("user3", "wrong"))).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(admin_gate_status(&fixture, None).await, StatusCode::UNAUTHORIZED);
    }
}
