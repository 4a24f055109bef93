use thiserror::Error;

/// Failures of the namespace and role stores.
#[derive(Debug, Error)]
pub enum DbError {
    /// The addressed row does not exist or is soft-deleted.
    #[error("Not found")]
    NotFound,

    /// A unique constraint rejected the write. Nothing was changed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stored data that does not map onto the model, such as an unknown permission level.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// `map_err` adapter for namespace writes: a unique violation means `code` is taken.
    pub(crate) fn namespace_code_taken(code: &str) -> impl FnOnce(sqlx::Error) -> DbError + '_ {
        move |e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DbError::Conflict(format!("Namespace with code '{code}' already exists"))
            }
            other => DbError::Sqlx(other),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_constraint_errors_pass_through() {
        let err = DbError::namespace_code_taken("ns1")(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Sqlx(sqlx::Error::RowNotFound)));
    }
}
