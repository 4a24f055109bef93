use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{Router, routing::get};
use clap::Parser;
use tokio_util::task::TaskTracker;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

mod api_types;
mod auth;
mod cache;
mod config;
mod db;
pub mod events;
mod middleware;
mod models;
pub mod observability;
mod routes;
pub mod services;

#[cfg(test)]
mod tests;

/// Config file picked up from the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "runledger.toml";

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::DbPool>,
    pub namespaces: services::NamespaceService,
    /// Namespace resolution and access checks, shared with the middleware.
    pub authorizer: middleware::Authorizer,
}

/// Anything that stops the server from coming up.
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Tracing(#[from] observability::TracingError),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Users file error: {0}")]
    UsersFile(#[from] auth::UsersFileError),

    #[error(transparent)]
    Notifier(#[from] events::NotifierError),

    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// CLI arguments for runledger
#[derive(Parser, Debug)]
#[command(version, about = "Experiment tracking server", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./runledger.toml if it exists, otherwise
    /// built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Start the server (default)
    Serve,
    /// Run database migrations and exit
    ///
    /// Useful for init containers or CI pipelines.
    Migrate,
}

pub fn build_app(config: &config::RunledgerConfig, state: AppState) -> Router {
    let admin = routes::admin::admin_routes().route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::admin_auth_middleware,
    ));

    let scoped = routes::namespace_routes().route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::namespace_auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/health/ready", get(routes::health::readiness))
        .route("/version", get(routes::health::version))
        .route(
            "/set-cookie/{access_token}",
            get(routes::health::set_access_token_cookie),
        )
        .nest("/admin", admin)
        .merge(scoped.clone())
        .nest("/ns/{namespace}", scoped)
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(tower_cookies::CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let result = match args.command {
        Some(Command::Migrate) => run_migrate(args.config.as_deref()).await,
        Some(Command::Serve) | None => run_server(args.config.as_deref()).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Startup failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(explicit_path: Option<&Path>) -> Result<config::RunledgerConfig, StartupError> {
    let path = match explicit_path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Path::new(DEFAULT_CONFIG_FILE),
        None => return Ok(config::RunledgerConfig::default()),
    };
    Ok(config::RunledgerConfig::from_file(path)?)
}

/// Run the server until SIGINT/SIGTERM.
async fn run_server(config_path: Option<&Path>) -> Result<(), StartupError> {
    let config = Arc::new(load_config(config_path)?);
    observability::init_tracing(&config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting runledger");

    let db = Arc::new(db::DbPool::from_config(&config.database).await?);
    if config.database.run_migrations() {
        db.run_migrations().await?;
    }
    let default_namespace = db.namespaces().ensure_default().await?;
    tracing::debug!(id = default_namespace.id, "Default namespace present");

    let auth = auth::AuthMode::from_config(&config.auth)?;
    tracing::info!(mode = auth.name(), "Authentication configured");
    if let auth::AuthMode::Users(directory) = &auth {
        directory.seed_roles(db.roles().as_ref()).await?;
    }

    let task_tracker = TaskTracker::new();
    let notifier = db.change_notifier(&task_tracker);
    notifier.start().await?;

    let resync_interval = config.cache.resync_interval();
    let namespace_cache = Arc::new(
        cache::CachedNamespaceRepo::new(
            db.namespaces(),
            notifier.as_ref(),
            resync_interval,
            &task_tracker,
        )
        .await?,
    );
    let role_cache = Arc::new(
        cache::CachedRoleRepo::new(db.roles(), notifier.as_ref(), resync_interval, &task_tracker)
            .await?,
    );

    // The IdP may come up later than we do; keys are fetched again on first use
    if let auth::AuthMode::Oidc(validator) = &auth
        && let Err(e) = validator.prefetch().await
    {
        tracing::warn!(error = %e, "Could not prefetch JWKS, will retry on first request");
    }

    let state = AppState {
        db: Arc::clone(&db),
        namespaces: services::NamespaceService::new(Arc::clone(&namespace_cache)),
        authorizer: middleware::Authorizer::new(
            Arc::clone(&namespace_cache),
            Arc::clone(&role_cache),
            auth,
        ),
    };
    let app = build_app(&config, state);

    let bind_addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: bind_addr,
            source,
        })?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)?;

    // In-flight reloads finish; the refresh tasks then exit between reloads
    namespace_cache.close();
    role_cache.close();
    notifier.close();
    task_tracker.close();

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    if tokio::time::timeout(timeout, task_tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            pending = task_tracker.len(),
            "Timeout waiting for background tasks"
        );
    } else {
        tracing::info!("All background tasks completed");
    }

    db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}

/// Connect, run pending migrations and exit.
async fn run_migrate(config_path: Option<&Path>) -> Result<(), StartupError> {
    let config = load_config(config_path)?;
    observability::init_tracing(&config.observability)?;

    tracing::info!("Running database migrations");
    let db = db::DbPool::from_config(&config.database).await?;
    db.run_migrations().await?;
    db.namespaces().ensure_default().await?;
    db.close().await;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
