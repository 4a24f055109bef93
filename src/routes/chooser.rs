//! Namespace chooser endpoints. Both sit behind the authorization middleware, so the
//! caller is already identified.

use axum::{Extension, Json, extract::State};
use serde::Serialize;

use crate::{
    AppState,
    auth::Identity,
    middleware::NamespaceContext,
    models::{Namespace, PermissionLevel},
};

/// Namespaces visible to the caller, ordered by ID
#[derive(Debug, Serialize)]
pub struct ChooserNamespaces {
    pub data: Vec<Namespace>,
}

#[derive(Debug, Serialize)]
pub struct CurrentNamespace {
    pub namespace: Namespace,
    pub permission: PermissionLevel,
    pub is_admin: bool,
    pub identity: Identity,
}

#[tracing::instrument(name = "chooser.namespaces", skip_all)]
pub async fn list_namespaces(
    State(state): State<AppState>,
    Extension(ctx): Extension<NamespaceContext>,
) -> Json<ChooserNamespaces> {
    let permitted = state.authorizer.permitted_namespaces(&ctx.identity);
    let data = state
        .namespaces
        .list()
        .into_iter()
        .filter(|ns| permitted.contains(&ns.code))
        .map(|ns| ns.as_ref().clone())
        .collect();
    Json(ChooserNamespaces { data })
}

#[tracing::instrument(name = "chooser.current", skip_all)]
pub async fn current_namespace(
    State(state): State<AppState>,
    Extension(ctx): Extension<NamespaceContext>,
) -> Json<CurrentNamespace> {
    let is_admin = state.authorizer.is_admin(&ctx.identity);
    Json(CurrentNamespace {
        namespace: ctx.namespace.as_ref().clone(),
        permission: ctx.permission,
        is_admin,
        identity: ctx.identity,
    })
}
