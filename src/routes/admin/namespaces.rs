use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Serialize;

use super::error::AdminError;
use crate::{
    AppState,
    middleware::AdminContext,
    models::{CreateNamespace, Namespace, UpdateNamespace},
};

/// Every namespace, ordered by ID
#[derive(Debug, Serialize)]
pub struct NamespaceListResponse {
    pub data: Vec<Namespace>,
}

/// List namespaces
#[tracing::instrument(name = "admin.namespaces.list", skip_all)]
pub async fn list(State(state): State<AppState>) -> Json<NamespaceListResponse> {
    let data = state
        .namespaces
        .list()
        .into_iter()
        .map(|ns| ns.as_ref().clone())
        .collect();
    Json(NamespaceListResponse { data })
}

/// Get a namespace by ID
#[tracing::instrument(name = "admin.namespaces.get", skip(state), fields(%id))]
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Namespace>, AdminError> {
    let namespace = state.namespaces.get(id)?;
    Ok(Json(namespace.as_ref().clone()))
}

/// Create a namespace
#[tracing::instrument(name = "admin.namespaces.create", skip_all)]
pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AdminContext>,
    input: Result<Json<CreateNamespace>, JsonRejection>,
) -> Result<(StatusCode, Json<Namespace>), AdminError> {
    let Json(input) = input?;
    let namespace = state.namespaces.create(input).await?;
    tracing::info!(
        principal = ctx.identity.principal(),
        code = %namespace.code,
        "Namespace created via admin API"
    );
    Ok((StatusCode::CREATED, Json(namespace)))
}

/// Update a namespace's code and description
#[tracing::instrument(name = "admin.namespaces.update", skip(state, ctx, input), fields(%id))]
pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<AdminContext>,
    Path(id): Path<i64>,
    input: Result<Json<UpdateNamespace>, JsonRejection>,
) -> Result<Json<Namespace>, AdminError> {
    let Json(input) = input?;
    let namespace = state.namespaces.update(id, input).await?;
    tracing::info!(
        principal = ctx.identity.principal(),
        code = %namespace.code,
        "Namespace updated via admin API"
    );
    Ok(Json(namespace))
}
