//! HTTP server for Gridcast
//!
//! Wires the shared encoder supervisor and session registry into an axum
//! router and closes every live session before the server exits.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::routing::get;
use gridcast_core::config::{ConfigError, GridcastConfig};
use gridcast_core::encoder::{EncoderBackend, EncoderSupervisor, FfmpegBackend};
use gridcast_core::registry::{RegistryHandle, spawn_registry};
use gridcast_core::session::SessionContext;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{api_sessions, health, stream_handler};

/// How long shutdown waits for sessions to deregister.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum WebError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GridcastConfig>,
    pub supervisor: Arc<EncoderSupervisor>,
    pub registry: RegistryHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Creates the shared state and spawns the session registry.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: GridcastConfig, backend: Arc<dyn EncoderBackend>) -> Self {
        let supervisor = Arc::new(EncoderSupervisor::new(backend, config.encoder.clone()));
        Self {
            config: Arc::new(config),
            supervisor,
            registry: spawn_registry(),
            started_at: Instant::now(),
        }
    }

    /// Everything a new session needs from the server.
    pub fn session_context(&self) -> SessionContext {
        SessionContext::new(
            &self.config,
            Arc::clone(&self.supervisor),
            self.registry.clone(),
        )
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(state.config.server.stream_path, get(stream_handler))
        .route("/api/sessions", get(api_sessions))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the server with the ffmpeg backend until Ctrl-C.
///
/// # Errors
///
/// - `WebError::Config` - Configuration failed validation
/// - `WebError::Bind` - The listen address is unavailable
/// - `WebError::Serve` - The accept loop failed
pub async fn run_server(config: GridcastConfig) -> Result<(), WebError> {
    config.validate()?;

    let backend: Arc<dyn EncoderBackend> =
        Arc::new(FfmpegBackend::new(config.encoder.program.clone()));
    let address = config.server.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| WebError::Bind {
            address: address.clone(),
            source,
        })?;

    let state = AppState::new(config, backend);
    info!(
        %address,
        path = state.config.server.stream_path,
        sources = state.config.encoder.source_count,
        "Gridcast server listening"
    );

    serve(listener, state, ctrl_c()).await
}

/// Serves requests on `listener` until `signal` resolves, then closes all
/// sessions and waits for open connections to finish.
///
/// # Errors
///
/// - `WebError::Serve` - The accept loop failed
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> Result<(), WebError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    let shutdown = async move {
        signal.await;
        close_sessions(&registry).await;
    };

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(WebError::Serve)?;

    info!("Server stopped");
    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn close_sessions(registry: &RegistryHandle) {
    match registry.shutdown_all(SHUTDOWN_GRACE).await {
        Ok(report) if report.remaining == 0 => {
            info!(closed = report.signalled, "All sessions closed");
        }
        Ok(report) => warn!(
            signalled = report.signalled,
            remaining = report.remaining,
            "Sessions still open after grace period"
        ),
        Err(e) => warn!("Could not close sessions: {}", e),
    }
}
