use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::NamespaceRepo,
    },
    models::{
        CreateNamespace, DEFAULT_NAMESPACE_CODE, DEFAULT_NAMESPACE_ID, Namespace, UpdateNamespace,
    },
};

/// Change notifications for this table come from database triggers, so the repo
/// never publishes events itself.
pub struct PostgresNamespaceRepo {
    write_pool: PgPool,
    read_pool: PgPool,
}

impl PostgresNamespaceRepo {
    pub fn new(write_pool: PgPool, read_pool: Option<PgPool>) -> Self {
        let read_pool = read_pool.unwrap_or_else(|| write_pool.clone());
        Self {
            write_pool,
            read_pool,
        }
    }

    fn namespace_from_row(row: &PgRow) -> Namespace {
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
    /// `id = None` draws from the sequence.
    async fn insert_default(&self, id: Option<i64>) -> DbResult<u64> {
        let mut tx = self.write_pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO namespaces (id, code, description)
            SELECT COALESCE($1, nextval(pg_get_serial_sequence('namespaces', 'id'))),
                   $2, 'Default namespace'
            WHERE NOT EXISTS (
                SELECT 1 FROM namespaces
                WHERE id = $1 OR (code = $2 AND deleted_at IS NULL)
            )
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(DEFAULT_NAMESPACE_CODE)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 && id.is_some() {
            // An explicit ID does not advance the sequence.
            sqlx::query(
                r#"
                SELECT setval(
                    pg_get_serial_sequence('namespaces', 'id'),
                    GREATEST((SELECT MAX(id) FROM namespaces), 1)
                )
                "#,
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NamespaceRepo for PostgresNamespaceRepo {
    async fn list_all(&self) -> DbResult<Vec<Namespace>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, description, default_experiment_id, created_at, updated_at
            FROM namespaces
            WHERE deleted_at IS NULL
            ORDER BY id
            "#,
        )
        // Cache reloads follow NOTIFYs from the primary; a replica may not have the write yet
        .fetch_all(&self.write_pool)
        .await?;

        Ok(rows.iter().map(Self::namespace_from_row).collect())
    }

    async fn get_by_code(&self, code: &str) -> DbResult<Option<Namespace>> {
        let row = sqlx::query(
            r#"
            SELECT id, code, description, default_experiment_id, created_at, updated_at
            FROM namespaces
            WHERE code = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(code)
        .fetch_optional(&self.read_pool)
        .await?;

        Ok(row.as_ref().map(Self::namespace_from_row))
    }

    async fn get_by_id(&self, id: i64) -> DbResult<Option<Namespace>> {
        let row = sqlx::query(
            r#"
            SELECT id, code, description, default_experiment_id, created_at, updated_at
            FROM namespaces
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.read_pool)
        .await?;

        Ok(row.as_ref().map(Self::namespace_from_row))
    }

    async fn create(&self, input: CreateNamespace) -> DbResult<Namespace> {
        let row = sqlx::query(
            r#"
            INSERT INTO namespaces (code, description)
            VALUES ($1, $2)
            RETURNING id, code, description, default_experiment_id, created_at, updated_at
            "#,
        )
        .bind(&input.code)
        .bind(&input.description)
        .fetch_one(&self.write_pool)
        .await
        .map_err(DbError::namespace_code_taken(&input.code))?;

        Ok(Self::namespace_from_row(&row))
    }

    async fn update(&self, id: i64, input: UpdateNamespace) -> DbResult<Namespace> {
        let row = sqlx::query(
            r#"
            UPDATE namespaces
            SET code = $1, description = $2, updated_at = NOW()
            WHERE id = $3 AND deleted_at IS NULL
            RETURNING id, code, description, default_experiment_id, created_at, updated_at
            "#,
        )
        .bind(&input.code)
        .bind(&input.description)
        .bind(id)
        .fetch_optional(&self.write_pool)
        .await
        .map_err(DbError::namespace_code_taken(&input.code))?;

        row.as_ref()
            .map(Self::namespace_from_row)
            .ok_or(DbError::NotFound)
    }

    async fn ensure_default(&self) -> DbResult<Namespace> {
        let mut inserted = self.insert_default(Some(DEFAULT_NAMESPACE_ID)).await?;

        if self.get_by_code(DEFAULT_NAMESPACE_CODE).await?.is_none() {
            tracing::warn!(
                id = DEFAULT_NAMESPACE_ID,
                "Reserved namespace ID is taken by another code, recreating '{}' with a new ID",
                DEFAULT_NAMESPACE_CODE
            );
            inserted += self.insert_default(None).await?;
        }

        if inserted > 0 {
            tracing::info!("Created default namespace");
        }

        // Read from the primary: a replica may not have the row yet.
        let row = sqlx::query(
            r#"
            SELECT id, code, description, default_experiment_id, created_at, updated_at
            FROM namespaces
            WHERE code = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(DEFAULT_NAMESPACE_CODE)
        .fetch_optional(&self.write_pool)
        .await?;

        row.as_ref()
            .map(Self::namespace_from_row)
            .ok_or_else(|| DbError::Internal("Default namespace could not be created".into()))
    }
}
