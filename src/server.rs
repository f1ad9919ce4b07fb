//! HTTP server bootstrap for the document sequencer.
//!
//! This module wires together:
//! - configuration
//! - the database pool (PostgreSQL or SQLite, chosen by `DATABASE_URL`)
//! - the allocator and definition administration
//! - the Axum router

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::FixedOffset;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::infra::{
    shutdown_signal, Allocator, AllocatorConfig, DefinitionAdmin, DefinitionRepository,
    PgSequenceStore, RetryConfig, SequenceStore, SequencerError, SqliteSequenceStore, SystemClock,
};
use crate::metrics::MetricsRegistry;

/// Storage backend selected from the database URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self, SequencerError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else {
            Err(SequencerError::Configuration(format!(
                "DATABASE_URL must start with postgres:// or sqlite:, got {url:?}"
            )))
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL.
    pub database_url: String,
    pub backend: Backend,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    pub migrate_on_startup: bool,
    /// Upper bound on waiting for a sequence row lock.
    pub lock_timeout: Duration,
    /// Retries of a contended allocation before returning 503.
    pub max_retries: u32,
    /// Offset of the clock that decides the calendar year.
    pub utc_offset: FixedOffset,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, SequencerError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| SequencerError::Configuration(format!("Invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, SequencerError> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/doc_sequencer".to_string());
        let backend = Backend::from_url(&database_url)?;

        let port: u16 = env_or("PORT", 8080)?;
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let listen_addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
            SequencerError::Configuration(format!("Invalid listen address {host}:{port}: {e}"))
        })?;

        let max_connections: u32 = env_or("MAX_DB_CONNECTIONS", 10)?;

        let migrate_on_startup = std::env::var("DB_MIGRATE_ON_STARTUP")
            .ok()
            .map(|v| {
                !matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "0" | "false" | "off"
                )
            })
            .unwrap_or(true);

        let lock_timeout_ms: u64 = env_or("ALLOCATION_LOCK_TIMEOUT_MS", 5_000)?;
        if lock_timeout_ms == 0 {
            return Err(SequencerError::Configuration(
                "ALLOCATION_LOCK_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let max_retries: u32 = env_or("ALLOCATION_MAX_RETRIES", 3)?;

        let offset_minutes: i32 = env_or("SEQUENCE_UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                SequencerError::Configuration(format!(
                    "SEQUENCE_UTC_OFFSET_MINUTES out of range: {offset_minutes}"
                ))
            })?;

        Ok(Self {
            database_url,
            backend,
            listen_addr,
            max_connections,
            migrate_on_startup,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            max_retries,
            utc_offset,
        })
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig::default()
            .with_lock_timeout(self.lock_timeout)
            .with_retry(RetryConfig::allocation().with_max_retries(self.max_retries))
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<Allocator>,
    pub admin: Arc<DefinitionAdmin>,
    pub store: Arc<dyn SequenceStore>,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
    /// Wire the services over one backend.
    pub fn new<S>(store: Arc<S>, config: &Config) -> Self
    where
        S: SequenceStore + DefinitionRepository + 'static,
    {
        let metrics = Arc::new(MetricsRegistry::new());
        let clock = Arc::new(SystemClock::with_offset(config.utc_offset));

        let allocator = Allocator::new(store.clone())
            .with_clock(clock.clone())
            .with_config(config.allocator_config())
            .with_metrics(metrics.clone());
        let admin = DefinitionAdmin::new(store.clone())
            .with_clock(clock)
            .with_metrics(metrics.clone());

        Self {
            allocator: Arc::new(allocator),
            admin: Arc::new(admin),
            store,
            metrics,
        }
    }
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting doc-sequencer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Backend: {:?}", config.backend);
    info!("  Max connections: {}", config.max_connections);
    info!("  Lock timeout: {:?}", config.lock_timeout);
    info!(
        "  Worst-case allocation wait: {:?}",
        config.allocator_config().max_wait()
    );
    info!("  Clock offset: {}", config.utc_offset);

    let state = connect(&config).await?;
    let app = build_router()?.with_state(state);

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("doc-sequencer is ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("doc-sequencer stopped");
    Ok(())
}

/// Connect to the configured backend, migrate if enabled, and build the state.
pub async fn connect(config: &Config) -> anyhow::Result<AppState> {
    match config.backend {
        Backend::Postgres => {
            info!("Connecting to PostgreSQL...");
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.database_url)
                .await?;
            info!("Connected to PostgreSQL");

            if config.migrate_on_startup {
                info!("Running database migrations...");
                crate::migrations::run_postgres(&pool).await?;
                info!("Database migrations applied");
            } else {
                info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
            }

            Ok(AppState::new(Arc::new(PgSequenceStore::new(pool)), config))
        }
        Backend::Sqlite => {
            info!("Opening SQLite database...");
            let pool = SqliteSequenceStore::connect(
                &config.database_url,
                config.max_connections,
                config.lock_timeout,
            )
            .await?;

            if config.migrate_on_startup {
                info!("Running database migrations...");
                crate::migrations::run_sqlite(&pool).await?;
                info!("Database migrations applied");
            } else {
                info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
            }

            Ok(AppState::new(
                Arc::new(SqliteSequenceStore::new(pool)),
                config,
            ))
        }
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Build the full router: `/api` plus health, readiness and metrics.
pub fn build_router() -> anyhow::Result<Router<AppState>> {
    let mut router = Router::new()
        .nest("/api", crate::api::router())
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_json))
        .route("/metrics/prometheus", get(metrics_prometheus))
        .layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors_layer_from_env()? {
        router = router.layer(cors_layer);
    }

    Ok(router)
}

fn cors_layer_from_env() -> anyhow::Result<Option<CorsLayer>> {
    let origins = match std::env::var("CORS_ALLOW_ORIGINS") {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE]),
    ))
}

/// Health check endpoint.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "doc-sequencer",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check endpoint.
async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match state.store.ping().await {
        Ok(()) => Ok(Json(serde_json::json!({
            "status": "ready",
            "database": "connected",
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Database unavailable: {}", e),
        )),
    }
}

async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.metrics.to_json().await)
}

async fn metrics_prometheus(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            Backend::from_url("postgres://localhost/db").unwrap(),
            Backend::Postgres
        );
        assert_eq!(
            Backend::from_url("sqlite::memory:").unwrap(),
            Backend::Sqlite
        );
        assert_eq!(
            Backend::from_url("sqlite://data/seq.db").unwrap(),
            Backend::Sqlite
        );
        assert!(matches!(
            Backend::from_url("mysql://localhost/db"),
            Err(SequencerError::Configuration(_))
        ));
    }

    #[test]
    fn test_allocator_config_from_config() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            backend: Backend::Sqlite,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 1,
            migrate_on_startup: true,
            lock_timeout: Duration::from_millis(250),
            max_retries: 7,
            utc_offset: FixedOffset::east_opt(0).unwrap(),
        };

        let allocator = config.allocator_config();
        assert_eq!(allocator.lock_timeout, Duration::from_millis(250));
        assert_eq!(allocator.retry.max_retries, 7);
    }
}
