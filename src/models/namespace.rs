use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validators::NAMESPACE_CODE_REGEX;

/// Code of the namespace every request falls back to when the path has no `/ns/{code}` prefix.
pub const DEFAULT_NAMESPACE_CODE: &str = "default";

/// ID reserved for the default namespace.
pub const DEFAULT_NAMESPACE_ID: i64 = 1;

/// A tenancy boundary for experiments and runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: i64,
    /// Unique among non-deleted namespaces; used in URLs and as the join key to roles
    pub code: String,
    pub description: String,
    /// Experiment created implicitly for runs that name no experiment
    pub default_experiment_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Namespace {
    pub fn is_default(&self) -> bool {
        self.code == DEFAULT_NAMESPACE_CODE
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateNamespace {
    #[validate(regex(path = *NAMESPACE_CODE_REGEX))]
    pub code: String,
    #[serde(default)]
    #[validate(length(max = 1024))]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateNamespace {
    #[validate(regex(path = *NAMESPACE_CODE_REGEX))]
    pub code: String,
    #[serde(default)]
    #[validate(length(max = 1024))]
    pub description: String,
}
