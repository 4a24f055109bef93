use std::{borrow::Cow, sync::LazyLock};

use regex::Regex;
use validator::ValidationError;

/// Namespace codes appear as a path segment (`/ns/{code}`), so they are restricted to
/// URL-safe characters. Examples: "default", "team-a", "Vision_2024"
pub static NAMESPACE_CODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());

const MAX_USER_NAME_LENGTH: usize = 255;

const MAX_USERS_PER_ROLE: usize = 10_000;

/// Validate the user identities bound to a role.
///
/// Rejects empty or over-long names and duplicates.
pub fn validate_role_users(users: &[String]) -> Result<(), ValidationError> {
    if users.len() > MAX_USERS_PER_ROLE {
        let mut err = ValidationError::new("too_many_users");
        err.message = Some(Cow::Owned(format!(
            "Maximum {} users per role",
            MAX_USERS_PER_ROLE
        )));
        return Err(err);
    }

    let mut seen = std::collections::HashSet::with_capacity(users.len());
    for user in users {
        if user.trim().is_empty() {
            let mut err = ValidationError::new("empty_user");
            err.message = Some(Cow::Borrowed(
                "User names cannot be empty or whitespace-only",
            ));
            return Err(err);
        }
        if user.len() > MAX_USER_NAME_LENGTH {
            let mut err = ValidationError::new("user_too_long");
            err.message = Some(Cow::Owned(format!(
                "User names cannot exceed {} characters",
                MAX_USER_NAME_LENGTH
            )));
            return Err(err);
        }
        if !seen.insert(user.as_str()) {
            let mut err = ValidationError::new("duplicate_user");
            err.message = Some(Cow::Owned(format!("User '{}' is listed twice", user)));
            return Err(err);
        }
    }
    Ok(())
}
