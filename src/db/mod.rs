mod error;
#[cfg(feature = "database-postgres")]
pub mod postgres;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

#[cfg(test)]
pub mod tests;

#[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
compile_error!("enable at least one of the `database-sqlite` or `database-postgres` features");

use std::{sync::Arc, time::Duration};

pub use error::{DbError, DbResult};
pub use repos::*;
use tokio_util::task::TaskTracker;

use crate::{
    config::DatabaseConfig,
    events::{ChangeNotifier, LocalNotifier},
};

/// PostgreSQL pool configuration with optional read replica.
#[cfg(feature = "database-postgres")]
pub struct PgPoolPair {
    /// Primary pool for writes and change notifications.
    pub write: sqlx::PgPool,
    /// Optional read replica for point lookups. Cache loads always use `write`.
    pub read: Option<sqlx::PgPool>,
}

/// Repository trait objects, created once at startup.
struct CachedRepos {
    namespaces: Arc<dyn NamespaceRepo>,
    roles: Arc<dyn RoleRepo>,
}

enum PoolStorage {
    /// SQLite has no cross-connection notifications; the repos publish to the
    /// notifier after each write.
    #[cfg(feature = "database-sqlite")]
    Sqlite(sqlx::SqlitePool, LocalNotifier),
    #[cfg(feature = "database-postgres")]
    Postgres(PgPoolPair),
}

/// Database pool supporting both SQLite and PostgreSQL.
///
/// Repositories are cached at construction time to avoid allocation on each access.
pub struct DbPool {
    inner: PoolStorage,
    repos: CachedRepos,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    #[cfg(feature = "database-sqlite")]
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let notifier = LocalNotifier::new();
        let repos = CachedRepos {
            namespaces: Arc::new(sqlite::SqliteNamespaceRepo::new(
                pool.clone(),
                notifier.clone(),
            )),
            roles: Arc::new(sqlite::SqliteRoleRepo::new(pool.clone(), notifier.clone())),
        };
        DbPool {
            inner: PoolStorage::Sqlite(pool, notifier),
            repos,
        }
    }

    /// Create a DbPool from existing PostgreSQL pools.
    /// Primarily useful for testing.
    #[cfg(feature = "database-postgres")]
    pub fn from_postgres(write_pool: sqlx::PgPool, read_pool: Option<sqlx::PgPool>) -> Self {
        let repos = CachedRepos {
            namespaces: Arc::new(postgres::PostgresNamespaceRepo::new(
                write_pool.clone(),
                read_pool.clone(),
            )),
            roles: Arc::new(postgres::PostgresRoleRepo::new(
                write_pool.clone(),
                read_pool.clone(),
            )),
        };
        DbPool {
            inner: PoolStorage::Postgres(PgPoolPair {
                write: write_pool,
                read: read_pool,
            }),
            repos,
        }
    }

    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(cfg) => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
                    .connect_with(
                        sqlx::sqlite::SqliteConnectOptions::new()
                            .filename(&cfg.path)
                            .create_if_missing(cfg.create_if_missing)
                            .foreign_keys(true)
                            .journal_mode(if cfg.wal_mode {
                                sqlx::sqlite::SqliteJournalMode::Wal
                            } else {
                                sqlx::sqlite::SqliteJournalMode::Delete
                            })
                            .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                tracing::info!(path = %cfg.path, "Connected to SQLite database");
                Ok(Self::from_sqlite(pool))
            }
            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(cfg) => {
                let options = |url: &str| -> DbResult<sqlx::postgres::PgConnectOptions> {
                    let options: sqlx::postgres::PgConnectOptions = url.parse()?;
                    Ok(options.ssl_mode(cfg.ssl_mode.into()))
                };
                let pool_options = || {
                    sqlx::postgres::PgPoolOptions::new()
                        .min_connections(cfg.min_connections)
                        .max_connections(cfg.max_connections)
                        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
                        .idle_timeout(Duration::from_secs(cfg.idle_timeout_secs))
                };

                let write_pool = pool_options().connect_with(options(&cfg.url)?).await?;

                let read_pool = if let Some(read_url) = &cfg.read_url {
                    tracing::info!("Configuring read replica pool");
                    Some(pool_options().connect_with(options(read_url)?).await?)
                } else {
                    None
                };

                tracing::info!("Connected to PostgreSQL database");
                Ok(Self::from_postgres(write_pool, read_pool))
            }
        }
    }

    /// Run database migrations using sqlx's migration runner
    /// This automatically creates and manages a _sqlx_migrations table
    /// Migrations always run on the primary (write) pool.
    pub async fn run_migrations(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool, _) => {
                tracing::info!("Running SQLite migrations");
                sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
                tracing::info!("SQLite migrations completed successfully");
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                tracing::info!("Running PostgreSQL migrations");
                sqlx::migrate!("./migrations_sqlx/postgres")
                    .run(&pools.write)
                    .await?;
                tracing::info!("PostgreSQL migrations completed successfully");
                Ok(())
            }
        }
    }

    /// Get namespace repository
    pub fn namespaces(&self) -> Arc<dyn NamespaceRepo> {
        Arc::clone(&self.repos.namespaces)
    }

    /// Get role repository
    pub fn roles(&self) -> Arc<dyn RoleRepo> {
        Arc::clone(&self.repos.roles)
    }

    /// Build the change notifier matching this database.
    ///
    /// PostgreSQL gets a `LISTEN/NOTIFY` listener on the primary (replicas cannot
    /// `LISTEN`); SQLite shares the in-process notifier its repositories publish to.
    /// The returned notifier still needs `start()`. Only the PostgreSQL listener spawns a
    /// task onto `task_tracker`.
    #[cfg_attr(not(feature = "database-postgres"), allow(unused_variables))]
    pub fn change_notifier(&self, task_tracker: &TaskTracker) -> Arc<dyn ChangeNotifier> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(_, notifier) => Arc::new(notifier.clone()),
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => Arc::new(crate::events::PgChangeNotifier::new(
                pools.write.clone(),
                task_tracker.clone(),
            )),
        }
    }

    /// Health check for database connectivity
    pub async fn health_check(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool, _) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                sqlx::query("SELECT 1").execute(&pools.write).await?;
                if let Some(read) = &pools.read {
                    sqlx::query("SELECT 1").execute(read).await?;
                }
                Ok(())
            }
        }
    }

    /// Close every pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool, _) => pool.close().await,
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                pools.write.close().await;
                if let Some(read) = &pools.read {
                    read.close().await;
                }
            }
        }
    }
}
