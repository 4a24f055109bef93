use async_trait::async_trait;

use crate::{
    db::error::DbResult,
    models::{CreateNamespace, Namespace, UpdateNamespace},
};

/// Durable namespace records. Every read ignores soft-deleted rows.
#[async_trait]
pub trait NamespaceRepo: Send + Sync {
    /// All live namespaces ordered by ID. Source of cache snapshots, so it must observe
    /// every write whose change event has been delivered (never served by a replica).
    async fn list_all(&self) -> DbResult<Vec<Namespace>>;

    async fn get_by_code(&self, code: &str) -> DbResult<Option<Namespace>>;

    async fn get_by_id(&self, id: i64) -> DbResult<Option<Namespace>>;

    /// Create a namespace. Fails with `DbError::Conflict` if the code is taken.
    async fn create(&self, input: CreateNamespace) -> DbResult<Namespace>;

    /// Change code and description. Fails with `DbError::NotFound` for an unknown ID and
    /// `DbError::Conflict` if another namespace holds the new code; the row is left
    /// untouched in both cases.
    async fn update(&self, id: i64, input: UpdateNamespace) -> DbResult<Namespace>;

    /// Make sure the `default` namespace exists with its reserved ID. Idempotent.
    async fn ensure_default(&self) -> DbResult<Namespace>;
}
