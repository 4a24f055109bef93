use std::sync::Arc;

use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::{
    cache::CachedNamespaceRepo,
    db::DbError,
    models::{CreateNamespace, Namespace, UpdateNamespace},
};

/// Errors from administrative namespace operations.
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("The namespace code is invalid.")]
    InvalidCode,

    #[error("The namespace code is already in use.")]
    CodeInUse,

    #[error("Invalid namespace: {0}")]
    InvalidInput(String),

    #[error("namespace not found by id: {0}")]
    NotFound(i64),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl NamespaceError {
    fn from_validation(errors: ValidationErrors) -> Self {
        if errors.field_errors().contains_key("code") {
            NamespaceError::InvalidCode
        } else {
            NamespaceError::InvalidInput(errors.to_string())
        }
    }

    fn from_write(error: DbError, id: Option<i64>) -> Self {
        match (error, id) {
            (DbError::Conflict(_), _) => NamespaceError::CodeInUse,
            (DbError::NotFound, Some(id)) => NamespaceError::NotFound(id),
            (other, _) => NamespaceError::Database(other),
        }
    }
}

/// Service layer for namespace administration.
///
/// Reads come from the namespace cache. Writes go to the store through the cache, so the
/// result is visible to this process as soon as the call returns.
#[derive(Clone)]
pub struct NamespaceService {
    cache: Arc<CachedNamespaceRepo>,
}

impl NamespaceService {
    pub fn new(cache: Arc<CachedNamespaceRepo>) -> Self {
        Self { cache }
    }

    /// All namespaces ordered by ID
    pub fn list(&self) -> Vec<Arc<Namespace>> {
        self.cache.list()
    }

    pub fn get(&self, id: i64) -> Result<Arc<Namespace>, NamespaceError> {
        self.cache.get_by_id(id).ok_or(NamespaceError::NotFound(id))
    }

    /// Create a namespace. The code must be valid and unused.
    pub async fn create(&self, input: CreateNamespace) -> Result<Namespace, NamespaceError> {
        input.validate().map_err(NamespaceError::from_validation)?;

        let namespace = self
            .cache
            .create(input)
            .await
            .map_err(|e| NamespaceError::from_write(e, None))?;

        tracing::info!(id = namespace.id, code = %namespace.code, "Namespace created");
        Ok(namespace)
    }

    /// Change code and description. Uniqueness is checked against every other namespace;
    /// on any failure the stored row is untouched.
    pub async fn update(
        &self,
        id: i64,
        input: UpdateNamespace,
    ) -> Result<Namespace, NamespaceError> {
        input.validate().map_err(NamespaceError::from_validation)?;

        let namespace = self
            .cache
            .update(id, input)
            .await
            .map_err(|e| NamespaceError::from_write(e, Some(id)))?;

        tracing::info!(id, code = %namespace.code, "Namespace updated");
        Ok(namespace)
    }
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use super::*;
    use crate::tests::fixtures::Fixture;

    fn create(code: &str) -> CreateNamespace {
        CreateNamespace {
            code: code.to_string(),
            description: String::new(),
        }
    }

    fn update(code: &str) -> UpdateNamespace {
        UpdateNamespace {
            code: code.to_string(),
            description: "renamed".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_then_visible() {
        let fixture = Fixture::empty().await;
        let service = NamespaceService::new(Arc::clone(&fixture.namespaces));

        let created = service.create(create("temp")).await.unwrap();

        assert_eq!(service.get(created.id).unwrap().code, "temp");
        let codes: Vec<String> = service.list().iter().map(|ns| ns.code.clone()).collect();
        assert_eq!(codes, vec!["default", "temp"]);
    }

    #[tokio::test]
    async fn test_invalid_code_rejected() {
        let fixture = Fixture::empty().await;
        let service = NamespaceService::new(Arc::clone(&fixture.namespaces));

        let err = service.create(create("not valid")).await.unwrap_err();
        assert!(matches!(err, NamespaceError::InvalidCode));
        assert_eq!(err.to_string(), "The namespace code is invalid.");
        assert_eq!(service.list().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_code_on_create() {
        let fixture = Fixture::empty().await;
        let service = NamespaceService::new(Arc::clone(&fixture.namespaces));

        let err = service.create(create("default")).await.unwrap_err();
        assert!(matches!(err, NamespaceError::CodeInUse));
        assert_eq!(err.to_string(), "The namespace code is already in use.");
    }

    #[tokio::test]
    async fn test_rename_to_existing_code_leaves_store_unchanged() {
        let fixture = Fixture::empty().await;
        let service = NamespaceService::new(Arc::clone(&fixture.namespaces));
        let temp = service.create(create("temp")).await.unwrap();

        let err = service.update(temp.id, update("default")).await.unwrap_err();
        assert!(matches!(err, NamespaceError::CodeInUse));

        let stored = fixture.db.namespaces().get_by_id(temp.id).await.unwrap().unwrap();
        assert_eq!(stored.code, "temp");
        assert_eq!(stored.description, "");
        assert_eq!(service.get(temp.id).unwrap().code, "temp");
    }

    #[tokio::test]
    async fn test_update_renames() {
        let fixture = Fixture::empty().await;
        let service = NamespaceService::new(Arc::clone(&fixture.namespaces));
        let temp = service.create(create("temp")).await.unwrap();

        let updated = service.update(temp.id, update("renamed")).await.unwrap();

        assert_eq!(updated.code, "renamed");
        assert!(fixture.namespaces.get_by_code("temp").is_none());
        assert_eq!(fixture.namespaces.get_by_code("renamed").unwrap().id, temp.id);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let fixture = Fixture::empty().await;
        let service = NamespaceService::new(Arc::clone(&fixture.namespaces));

        let err = service.get(999).unwrap_err();
        assert_eq!(err.to_string(), "namespace not found by id: 999");

        let err = service.update(999, update("whatever")).await.unwrap_err();
        assert!(matches!(err, NamespaceError::NotFound(999)));
    }
}
