use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool, sqlite::SqliteRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{RoleRepo, RoleRow, assemble_roles},
    },
    events::{Channel, LocalNotifier},
    models::{Role, RoleGrant, UpsertRole},
};

pub struct SqliteRoleRepo {
    pool: SqlitePool,
    notifier: LocalNotifier,
}

/// Which roles a load covers. Rendered into the WHERE clause of all three queries so the
/// child rows match the role rows.
enum RoleFilter<'a> {
    All,
    Name(&'a str),
    User(&'a str),
}

impl RoleFilter<'_> {
    fn roles_clause(&self) -> &'static str {
        match self {
            Self::All => "",
            Self::Name(_) => "WHERE name = ?",
            Self::User(_) => "WHERE id IN (SELECT role_id FROM role_users WHERE user_name = ?)",
        }
    }

    fn children_clause(&self) -> &'static str {
        match self {
            Self::All => "",
            Self::Name(_) => "WHERE role_id IN (SELECT id FROM roles WHERE name = ?)",
            Self::User(_) => {
                "WHERE role_id IN (SELECT role_id FROM role_users WHERE user_name = ?)"
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

fn role_row(row: &SqliteRow) -> RoleRow {
    RoleRow {
        id: row.get("id"),
        name: row.get("name"),
        is_admin: row.get("is_admin"),
        permission: row.get("permission"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl SqliteRoleRepo {
    pub fn new(pool: SqlitePool, notifier: LocalNotifier) -> Self {
        Self { pool, notifier }
    }

    /// Load roles and their child rows inside one transaction.
    async fn load(&self, filter: RoleFilter<'_>) -> DbResult<Vec<Role>> {
        let mut tx = self.pool.begin().await?;
        let roles = Self::load_with(&mut tx, &filter).await?;
        tx.commit().await?;
        Ok(roles)
    }

    async fn load_with(conn: &mut SqliteConnection, filter: &RoleFilter<'_>) -> DbResult<Vec<Role>> {
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

    async fn role_id(conn: &mut SqliteConnection, name: &str) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM roles WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(DbError::NotFound)
    }
}

#[async_trait]
impl RoleRepo for SqliteRoleRepo {
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
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await?;

        let role_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO roles (name, is_admin, permission, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                is_admin = excluded.is_admin,
                permission = excluded.permission,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(input.grant.is_all())
        .bind(input.permission.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM role_namespaces WHERE role_id = ?")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        if let RoleGrant::Namespaces(codes) = &input.grant {
            for (position, code) in codes.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO role_namespaces (role_id, namespace_code, position)
                    VALUES (?, ?, ?)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(role_id)
                .bind(code)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("DELETE FROM role_users WHERE role_id = ?")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        for (position, user) in input.users.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO role_users (role_id, user_name, position)
                VALUES (?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(role_id)
            .bind(user)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        let role = Self::load_with(&mut tx, &RoleFilter::Name(&input.name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::Internal(format!("Role '{}' vanished after upsert", input.name)))?;

        tx.commit().await?;
        self.notifier.notify(Channel::Roles);

        Ok(role)
    }

    async fn add_user(&self, role_name: &str, user: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let role_id = Self::role_id(&mut tx, role_name).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO role_users (role_id, user_name, position)
            SELECT ?, ?, COALESCE(MAX(position), -1) + 1
            FROM role_users
            WHERE role_id = ?
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(user)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query("UPDATE roles SET updated_at = ? WHERE id = ?")
                .bind(chrono::Utc::now())
                .bind(role_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if result.rows_affected() > 0 {
            self.notifier.notify(Channel::Roles);
        }
        Ok(())
    }

    async fn remove_user(&self, role_name: &str, user: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let role_id = Self::role_id(&mut tx, role_name).await?;

        let result = sqlx::query("DELETE FROM role_users WHERE role_id = ? AND user_name = ?")
            .bind(role_id)
            .bind(user)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        sqlx::query("UPDATE roles SET updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now())
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.notifier.notify(Channel::Roles);
        Ok(())
    }

    async fn delete(&self, role_name: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let role_id = Self::role_id(&mut tx, role_name).await?;

        // Children first; the connection may not enforce foreign keys.
        sqlx::query("DELETE FROM role_namespaces WHERE role_id = ?")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM role_users WHERE role_id = ?")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM roles WHERE id = ?")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.notifier.notify(Channel::Roles);
        Ok(())
    }
}
