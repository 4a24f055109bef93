use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::NamespaceRepo,
    },
    events::{Channel, LocalNotifier},
    models::{
        CreateNamespace, DEFAULT_NAMESPACE_CODE, DEFAULT_NAMESPACE_ID, Namespace, UpdateNamespace,
    },
};

pub struct SqliteNamespaceRepo {
    pool: SqlitePool,
    notifier: LocalNotifier,
}

impl SqliteNamespaceRepo {
    /// `notifier` is told about every committed write; SQLite has no server-side
    /// notification of its own.
    pub fn new(pool: SqlitePool, notifier: LocalNotifier) -> Self {
        Self { pool, notifier }
    }

    fn namespace_from_row(row: &SqliteRow) -> Namespace {
        Namespace {
            id: row.get("id"),
            code: row.get("code"),
            description: row.get("description"),
            default_experiment_id: row.get("default_experiment_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    /// Insert the default namespace unless the ID or the code is already taken.
    /// `id = None` lets SQLite assign one.
    async fn insert_default(&self, id: Option<i64>) -> DbResult<u64> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO namespaces (id, code, description, created_at, updated_at)
            SELECT ?, ?, 'Default namespace', ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM namespaces
                WHERE id = ? OR (code = ? AND deleted_at IS NULL)
            )
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(DEFAULT_NAMESPACE_CODE)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(DEFAULT_NAMESPACE_CODE)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NamespaceRepo for SqliteNamespaceRepo {
    async fn list_all(&self) -> DbResult<Vec<Namespace>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, description, default_experiment_id, created_at, updated_at
            FROM namespaces
            WHERE deleted_at IS NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::namespace_from_row).collect())
    }

    async fn get_by_code(&self, code: &str) -> DbResult<Option<Namespace>> {
        let row = sqlx::query(
            r#"
            SELECT id, code, description, default_experiment_id, created_at, updated_at
            FROM namespaces
            WHERE code = ? AND deleted_at IS NULL
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::namespace_from_row))
    }

    async fn get_by_id(&self, id: i64) -> DbResult<Option<Namespace>> {
        let row = sqlx::query(
            r#"
            SELECT id, code, description, default_experiment_id, created_at, updated_at
            FROM namespaces
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::namespace_from_row))
    }

    async fn create(&self, input: CreateNamespace) -> DbResult<Namespace> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO namespaces (code, description, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&input.code)
        .bind(&input.description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::namespace_code_taken(&input.code))?;

        self.notifier.notify(Channel::Namespaces);

        Ok(Namespace {
            id: result.last_insert_rowid(),
            code: input.code,
            description: input.description,
            default_experiment_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, id: i64, input: UpdateNamespace) -> DbResult<Namespace> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE namespaces
            SET code = ?, description = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&input.code)
        .bind(&input.description)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::namespace_code_taken(&input.code))?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        self.notifier.notify(Channel::Namespaces);

        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    async fn ensure_default(&self) -> DbResult<Namespace> {
        let mut inserted = self.insert_default(Some(DEFAULT_NAMESPACE_ID)).await?;

        if self.get_by_code(DEFAULT_NAMESPACE_CODE).await?.is_none() {
            // The reserved ID belongs to a namespace that was renamed.
            tracing::warn!(
                id = DEFAULT_NAMESPACE_ID,
                "Reserved namespace ID is taken by another code, recreating '{}' with a new ID",
                DEFAULT_NAMESPACE_CODE
            );
            inserted += self.insert_default(None).await?;
        }

        if inserted > 0 {
            tracing::info!("Created default namespace");
            self.notifier.notify(Channel::Namespaces);
        }

        self.get_by_code(DEFAULT_NAMESPACE_CODE)
            .await?
            .ok_or_else(|| DbError::Internal("Default namespace could not be created".into()))
    }
}
