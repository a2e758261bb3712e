use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use quire_core::LlmProvider;
use quire_engine::{ExecutorConfig, ExecutorRegistry};
use quire_store::Database;

use crate::handlers;
use crate::service::TurnService;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Interval between SSE keep-alive comments.
    pub keep_alive: Duration,
    /// Model used when a turn request does not name one.
    pub default_model: String,
    pub executor: ExecutorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9091,
            keep_alive: Duration::from_secs(10),
            default_model: "lorem-fast".into(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TurnService>,
    pub keep_alive: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/chats", post(handlers::create_chat).get(handlers::list_chats))
        .route("/api/turns", post(handlers::create_turn))
        .route("/api/turns/{id}", get(handlers::get_turn))
        .route("/api/turns/{id}/blocks", get(handlers::turn_blocks))
        .route("/api/turns/{id}/stream", get(handlers::stream_turn))
        .route("/api/turns/{id}/interrupt", post(handlers::interrupt_turn))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ExecutorRegistry>,
) -> Result<ServerHandle, std::io::Error> {
    let service = Arc::new(TurnService::new(
        db,
        provider,
        registry,
        config.executor.clone(),
        config.default_model.clone(),
    ));
    let router = build_router(AppState {
        service,
        keep_alive: config.keep_alive,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(port = local_addr.port(), default_model = %config.default_model, "quire server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for open requests to finish.
    /// Open event streams end once their turns do.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed");
        }
    }
}
