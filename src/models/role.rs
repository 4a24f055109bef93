use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validators::validate_role_users;

/// Name of the role that grants every namespace.
pub const ADMIN_ROLE: &str = "admin";

/// Prefix of role names that grant a single namespace (`ns:<code>`).
pub const NAMESPACE_ROLE_PREFIX: &str = "ns:";

/// Access level a role confers within its namespaces.
///
/// Ordered so that the higher level compares greater; merging two grants keeps the max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    ReadOnly,
    ReadWrite,
}

impl Default for PermissionLevel {
    fn default() -> Self {
        Self::ReadWrite
    }
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::ReadWrite => "read_write",
        }
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_only" => Ok(Self::ReadOnly),
            "read_write" => Ok(Self::ReadWrite),
            other => Err(format!("unknown permission level: {other}")),
        }
    }
}

/// Namespaces a role grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "codes", rename_all = "snake_case")]
pub enum RoleGrant {
    /// Every namespace, present and future
    All,
    /// Listed namespace codes, in configured order. Codes are not checked against the
    /// namespace table here; unknown codes simply never match.
    Namespaces(Vec<String>),
}

impl RoleGrant {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Derive the grant implied by a role name: `admin` grants everything and
    /// `ns:<code>` grants that one namespace.
    pub fn from_role_name(name: &str) -> Option<Self> {
        if name == ADMIN_ROLE {
            return Some(Self::All);
        }
        name.strip_prefix(NAMESPACE_ROLE_PREFIX)
            .filter(|code| !code.is_empty())
            .map(|code| Self::Namespaces(vec![code.to_string()]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub grant: RoleGrant,
    /// Bound user identities, in binding order
    pub users: Vec<String>,
    pub permission: PermissionLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        self.grant.is_all()
    }
}

/// Create a role or replace an existing role of the same name.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpsertRole {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub grant: RoleGrant,
    #[serde(default)]
    #[validate(custom(function = "validate_role_users"))]
    pub users: Vec<String>,
    #[serde(default)]
    pub permission: PermissionLevel,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_permission_level_ordering() {
        assert!(PermissionLevel::ReadWrite > PermissionLevel::ReadOnly);
        assert_eq!(
            PermissionLevel::ReadOnly.max(PermissionLevel::ReadWrite),
            PermissionLevel::ReadWrite
        );
    }

    #[rstest]
    #[case("read_only", Some(PermissionLevel::ReadOnly))]
    #[case("read_write", Some(PermissionLevel::ReadWrite))]
    #[case("admin", None)]
    fn test_permission_level_parse(#[case] input: &str, #[case] expected: Option<PermissionLevel>) {
        assert_eq!(input.parse::<PermissionLevel>().ok(), expected);
    }

    #[rstest]
    #[case("admin", Some(RoleGrant::All))]
    #[case("ns:team-a", Some(RoleGrant::Namespaces(vec!["team-a".to_string()])))]
    #[case("ns:", None)]
    #[case("viewer", None)]
    fn test_grant_from_role_name(#[case] name: &str, #[case] expected: Option<RoleGrant>) {
        assert_eq!(RoleGrant::from_role_name(name), expected);
    }

    #[test]
    fn test_grant_serialization_shape() {
        let json = serde_json::to_value(RoleGrant::Namespaces(vec!["a".into()])).unwrap();
        assert_eq!(json, serde_json::json!({"type": "namespaces", "codes": ["a"]}));

        let json = serde_json::to_value(RoleGrant::All).unwrap();
        assert_eq!(json, serde_json::json!({"type": "all"}));
    }
}
