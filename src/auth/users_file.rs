//! Static per-user credentials loaded from a YAML file.
//!
//! ```yaml
//! users:
//!   - name: user1
//!     roles: ["ns:namespace1", "ns:namespace2"]
//!     password: user1password
//!   - name: user3
//!     roles: ["admin"]
//!     password: "sha256:<hex digest>"
//! ```

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{AuthError, Identity};
use crate::{
    db::{DbError, RoleRepo},
    models::{NAMESPACE_CODE_REGEX, PermissionLevel, RoleGrant, UpsertRole},
};

const SHA256_PREFIX: &str = "sha256:";

#[derive(Debug, thiserror::Error)]
pub enum UsersFileError {
    #[error("Failed to read users file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse users file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("User name cannot be empty")]
    EmptyName,

    #[error("User '{0}' is listed more than once")]
    DuplicateUser(String),

    #[error("User '{user}' has invalid role '{role}': expected 'admin' or 'ns:<code>'")]
    InvalidRole { user: String, role: String },

    #[error("User '{0}' has an invalid sha256 password digest")]
    InvalidPasswordHash(String),

    #[error("Failed to seed roles: {0}")]
    Seed(#[from] DbError),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUsersFile {
    #[serde(default)]
    users: Vec<RawUser>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUser {
    name: String,
    #[serde(default)]
    roles: Vec<String>,
    password: String,
}

/// Stored secret. Plain passwords are hashed on load so both forms compare the same way.
#[derive(Clone)]
struct PasswordDigest([u8; 32]);

impl PasswordDigest {
    fn of(password: &str) -> Self {
        Self(Sha256::digest(password.as_bytes()).into())
    }

    fn parse(user: &str, configured: &str) -> Result<Self, UsersFileError> {
        let Some(hex_digest) = configured.strip_prefix(SHA256_PREFIX) else {
            return Ok(Self::of(configured));
        };
        let bytes = hex::decode(hex_digest.trim())
            .map_err(|_| UsersFileError::InvalidPasswordHash(user.to_string()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| UsersFileError::InvalidPasswordHash(user.to_string()))?;
        Ok(Self(digest))
    }

    fn matches(&self, candidate: &str) -> bool {
        Self::of(candidate).0.ct_eq(&self.0).into()
    }
}

/// One user from the users file.
#[derive(Clone)]
pub struct UserRecord {
    pub name: String,
    /// Role names in file order, each `admin` or `ns:<code>`
    pub roles: Vec<String>,
    password: PasswordDigest,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .field("password", &"****")
            .finish()
    }
}

/// Credentials of every configured user.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: Vec<UserRecord>,
    index: HashMap<String, usize>,
}

impl UserDirectory {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UsersFileError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| UsersFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, UsersFileError> {
        let raw: RawUsersFile = serde_yaml::from_str(contents)?;

        let mut directory = Self::default();
        for user in raw.users {
            if user.name.trim().is_empty() {
                return Err(UsersFileError::EmptyName);
            }
            if directory.index.contains_key(&user.name) {
                return Err(UsersFileError::DuplicateUser(user.name));
            }
            for role in &user.roles {
                if !is_valid_role_name(role) {
                    return Err(UsersFileError::InvalidRole {
                        user: user.name.clone(),
                        role: role.clone(),
                    });
                }
            }

            let password = PasswordDigest::parse(&user.name, &user.password)?;
            directory
                .index
                .insert(user.name.clone(), directory.users.len());
            directory.users.push(UserRecord {
                name: user.name,
                roles: user.roles,
                password,
            });
        }
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn users(&self) -> impl Iterator<Item = &UserRecord> {
        self.users.iter()
    }

    /// Check a username/password pair.
    ///
    /// Unknown users are compared against a throwaway digest so both failure paths
    /// cost the same.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        match self.index.get(username).map(|&i| &self.users[i]) {
            Some(user) if user.password.matches(password) => Ok(Identity::User {
                name: user.name.clone(),
            }),
            Some(_) => Err(AuthError::InvalidCredentials),
            None => {
                let _ = PasswordDigest([0; 32]).matches(password);
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    /// Make the role store agree with the file for every listed user.
    ///
    /// Each listed user ends up bound to exactly the roles the file names: missing
    /// bindings are added and bindings the file no longer lists are removed. Roles that do
    /// not exist yet are created with `read_write` permission and the grant implied by
    /// their name. Users absent from the file are not touched. Returns the number of
    /// bindings added and removed.
    pub async fn seed_roles(&self, roles: &dyn RoleRepo) -> Result<usize, UsersFileError> {
        let mut changes = 0;
        for user in &self.users {
            let bound: HashSet<String> = roles
                .get_by_user(&user.name)
                .await?
                .into_iter()
                .map(|role| role.name)
                .collect();

            for role_name in bound.iter().filter(|name| !user.roles.contains(*name)) {
                match roles.remove_user(role_name, &user.name).await {
                    // Already gone
                    Ok(()) | Err(DbError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
                tracing::info!(user = %user.name, role = %role_name, "Revoked role no longer in users file");
                changes += 1;
            }

            for role_name in user.roles.iter().filter(|name| !bound.contains(*name)) {
                self.bind(roles, &user.name, role_name).await?;
                changes += 1;
            }
        }
        tracing::info!(
            users = self.users.len(),
            changes,
            "Synchronized role bindings with users file"
        );
        Ok(changes)
    }

    async fn bind(
        &self,
        roles: &dyn RoleRepo,
        user: &str,
        role_name: &str,
    ) -> Result<(), UsersFileError> {
        if roles.get_by_name(role_name).await?.is_some() {
            roles.add_user(role_name, user).await?;
            return Ok(());
        }

        let grant =
            RoleGrant::from_role_name(role_name).ok_or_else(|| UsersFileError::InvalidRole {
                user: user.to_string(),
                role: role_name.to_string(),
            })?;
        match roles
            .upsert(UpsertRole {
                name: role_name.to_string(),
                grant,
                users: vec![user.to_string()],
                permission: PermissionLevel::ReadWrite,
            })
            .await
        {
            Ok(_) => {
                tracing::info!(role = %role_name, "Created role from users file");
                Ok(())
            }
            // Another process created it in between
            Err(DbError::Conflict(_)) => Ok(roles.add_user(role_name, user).await?),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_valid_role_name(role: &str) -> bool {
    match RoleGrant::from_role_name(role) {
        Some(RoleGrant::All) => true,
        Some(RoleGrant::Namespaces(codes)) => {
            codes.iter().all(|code| NAMESPACE_CODE_REGEX.is_match(code))
        }
        None => false,
    }
}
