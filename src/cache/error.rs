use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The first load failed; the cache was never usable.
    #[error("Initial load of the {cache} cache failed: {source}")]
    InitialLoad {
        cache: &'static str,
        #[source]
        source: DbError,
    },

    #[error("Reload of the {cache} cache failed: {source}")]
    Reload {
        cache: &'static str,
        #[source]
        source: DbError,
    },
}

pub type CacheResult<T> = Result<T, CacheError>;
