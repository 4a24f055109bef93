use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::{DbError, DbResult},
    models::{PermissionLevel, Role, RoleGrant, UpsertRole},
};

#[async_trait]
pub trait RoleRepo: Send + Sync {
    /// Every role with its namespaces and users, read as one consistent snapshot. Source
    /// of cache snapshots, so never served by a replica.
    async fn list_all(&self) -> DbResult<Vec<Role>>;

    /// Roles the user is bound to.
    async fn get_by_user(&self, user: &str) -> DbResult<Vec<Role>>;

    async fn get_by_name(&self, name: &str) -> DbResult<Option<Role>>;

    /// Create the role, or replace grant, permission and user bindings of the role
    /// with the same name.
    async fn upsert(&self, input: UpsertRole) -> DbResult<Role>;

    /// Bind a user to an existing role. Binding an already bound user is a no-op.
    async fn add_user(&self, role_name: &str, user: &str) -> DbResult<()>;

    /// Unbind a user. `DbError::NotFound` if the role or the binding does not exist.
    async fn remove_user(&self, role_name: &str, user: &str) -> DbResult<()>;

    async fn delete(&self, role_name: &str) -> DbResult<()>;
}

/// Row of the `roles` table before its namespace and user lists are attached.
pub(crate) struct RoleRow {
    pub id: i64,
    pub name: String,
    pub is_admin: bool,
    pub permission: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Join role rows with their `(role_id, value)` child rows. Child rows must already be
/// sorted by position; output keeps the order of `roles`.
pub(crate) fn assemble_roles(
    roles: Vec<RoleRow>,
    namespaces: Vec<(i64, String)>,
    users: Vec<(i64, String)>,
) -> DbResult<Vec<Role>> {
    let mut namespaces_by_role: HashMap<i64, Vec<String>> = HashMap::new();
    for (role_id, code) in namespaces {
        namespaces_by_role.entry(role_id).or_default().push(code);
    }
    let mut users_by_role: HashMap<i64, Vec<String>> = HashMap::new();
    for (role_id, user) in users {
        users_by_role.entry(role_id).or_default().push(user);
    }

    roles
        .into_iter()
        .map(|row| {
            let permission: PermissionLevel = row.permission.parse().map_err(|e| {
                DbError::Internal(format!("Invalid permission for role '{}': {}", row.name, e))
            })?;
            let grant = if row.is_admin {
                RoleGrant::All
            } else {
                RoleGrant::Namespaces(namespaces_by_role.remove(&row.id).unwrap_or_default())
            };
            Ok(Role {
                id: row.id,
                users: users_by_role.remove(&row.id).unwrap_or_default(),
                name: row.name,
                grant,
                permission,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        })
        .collect()
}
