use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{RoleRepo, RoleRow, assemble_roles},
    },
    models::{Role, RoleGrant, UpsertRole},
};

pub struct PostgresRoleRepo {
    write_pool: PgPool,
    read_pool: PgPool,
}

enum RoleFilter<'a> {
    All,
    Name(&'a str),
    User(&'a str),
}

impl RoleFilter<'_> {
    fn roles_clause(&self) -> &'static str {
        match self {
            Self::All => "",
            Self::Name(_) => "WHERE name = $1",
            Self::User(_) => "WHERE id IN (SELECT role_id FROM role_users WHERE user_name = $1)",
        }
    }

    fn children_clause(&self) -> &'static str {
        match self {
            Self::All => "",
            Self::Name(_) => "WHERE role_id IN (SELECT id FROM roles WHERE name = $1)",
            Self::User(_) => {
                "WHERE role_id IN (SELECT role_id FROM role_users WHERE user_name = $1)"
            }
        }
    }

    fn param(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Name(v) | Self::User(v) => Some(v),
        }
    }
}

fn role_row(row: &PgRow) -> RoleRow {
    RoleRow {
        id: row.get("id"),
        name: row.get("name"),
        is_admin: row.get("is_admin"),
        permission: row.get("permission"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl PostgresRoleRepo {
    pub fn new(write_pool: PgPool, read_pool: Option<PgPool>) -> Self {
        let read_pool = read_pool.unwrap_or_else(|| write_pool.clone());
        Self {
            write_pool,
            read_pool,
        }
    }

    /// The three queries run in one REPEATABLE READ transaction so that child rows
    /// belong to the same committed state as the role rows.
    ///
    /// Full loads feed the role cache after a NOTIFY from the primary, so they read the
    /// primary: a lagging replica would publish a snapshot missing the notified write.
    async fn load(&self, filter: RoleFilter<'_>) -> DbResult<Vec<Role>> {
        let pool = match filter {
            RoleFilter::All => &self.write_pool,
            _ => &self.read_pool,
        };
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let roles = Self::load_with(&mut tx, &filter).await?;
        tx.commit().await?;
        Ok(roles)
    }

    async fn load_with(conn: &mut PgConnection, filter: &RoleFilter<'_>) -> DbResult<Vec<Role>> {
        let roles_query = format!(
            r#"
            SELECT id, name, is_admin, permission, created_at, updated_at
            FROM roles
            {}
            ORDER BY id
            "#,
            filter.roles_clause()
        );
        let mut query = sqlx::query(&roles_query);
        if let Some(param) = filter.param() {
            query = query.bind(param);
        }
        let roles: Vec<RoleRow> = query.fetch_all(&mut *conn).await?.iter().map(role_row).collect();

        if roles.is_empty() {
            return Ok(Vec::new());
        }

        let namespaces_query = format!(
            r#"
            SELECT role_id, namespace_code
            FROM role_namespaces
            {}
            ORDER BY role_id, position
            "#,
            filter.children_clause()
        );
        let mut query = sqlx::query(&namespaces_query);
        if let Some(param) = filter.param() {
            query = query.bind(param);
        }
        let namespaces = query
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|row| (row.get("role_id"), row.get("namespace_code")))
            .collect();

        let users_query = format!(
            r#"
            SELECT role_id, user_name
            FROM role_users
            {}
            ORDER BY role_id, position
            "#,
            filter.children_clause()
        );
        let mut query = sqlx::query(&users_query);
        if let Some(param) = filter.param() {
            query = query.bind(param);
        }
        let users = query
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|row| (row.get("role_id"), row.get("user_name")))
            .collect();

        assemble_roles(roles, namespaces, users)
    }

    /// Lock the role row for the rest of the transaction.
    async fn lock_role(conn: &mut PgConnection, name: &str) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM roles WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(DbError::NotFound)
    }
}

#[async_trait]
impl RoleRepo for PostgresRoleRepo {
    async fn list_all(&self) -> DbResult<Vec<Role>> {
        self.load(RoleFilter::All).await
    }

    async fn get_by_user(&self, user: &str) -> DbResult<Vec<Role>> {
        self.load(RoleFilter::User(user)).await
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Option<Role>> {
        Ok(self.load(RoleFilter::Name(name)).await?.into_iter().next())
    }

    async fn upsert(&self, input: UpsertRole) -> DbResult<Role> {
        let mut tx = self.write_pool.begin().await?;

        let role_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO roles (name, is_admin, permission)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                is_admin = EXCLUDED.is_admin,
                permission = EXCLUDED.permission,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(input.grant.is_all())
        .bind(input.permission.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM role_namespaces WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        if let RoleGrant::Namespaces(codes) = &input.grant
            && !codes.is_empty()
        {
            let positions: Vec<i32> = (0..codes.len() as i32).collect();
            sqlx::query(
                r#"
                INSERT INTO role_namespaces (role_id, namespace_code, position)
                SELECT $1, code, position
                FROM UNNEST($2::text[], $3::int4[]) AS t(code, position)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(role_id)
            .bind(codes)
            .bind(&positions)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM role_users WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        if !input.users.is_empty() {
            let positions: Vec<i32> = (0..input.users.len() as i32).collect();
            sqlx::query(
                r#"
                INSERT INTO role_users (role_id, user_name, position)
                SELECT $1, user_name, position
                FROM UNNEST($2::text[], $3::int4[]) AS t(user_name, position)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(role_id)
            .bind(&input.users)
            .bind(&positions)
            .execute(&mut *tx)
            .await?;
        }

        let role = Self::load_with(&mut tx, &RoleFilter::Name(&input.name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::Internal(format!("Role '{}' vanished after upsert", input.name)))?;

        tx.commit().await?;
        Ok(role)
    }

    async fn add_user(&self, role_name: &str, user: &str) -> DbResult<()> {
        let mut tx = self.write_pool.begin().await?;
        let role_id = Self::lock_role(&mut tx, role_name).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO role_users (role_id, user_name, position)
            SELECT $1, $2, COALESCE(MAX(position), -1) + 1
            FROM role_users
            WHERE role_id = $1
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(user)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query("UPDATE roles SET updated_at = NOW() WHERE id = $1")
                .bind(role_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_user(&self, role_name: &str, user: &str) -> DbResult<()> {
        let mut tx = self.write_pool.begin().await?;
        let role_id = Self::lock_role(&mut tx, role_name).await?;

        let result = sqlx::query("DELETE FROM role_users WHERE role_id = $1 AND user_name = $2")
            .bind(role_id)
            .bind(user)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        sqlx::query("UPDATE roles SET updated_at = NOW() WHERE id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, role_name: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM roles WHERE name = $1")
            .bind(role_name)
            .execute(&self.write_pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}
