//! Controller server

use crate::common::{Config, Result};
use crate::controller::http::{create_router, AppState};
use crate::store::Store;
use axum::Router;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub struct Controller {
    config: Config,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build the router over an already opened store.
    pub fn router(&self, store: Store) -> Router {
        let state = AppState::new(store, &self.config.store);
        create_router(state, self.config.server.body_limit_bytes)
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting deployment controller v{}", crate::VERSION);
        tracing::info!("  HTTP API: {}", self.config.server.bind_addr);
        tracing::info!("  DB path: {}", self.config.store.db_path.display());
        tracing::info!("  Max connections: {}", self.config.store.max_conns);

        let store = Store::open(&self.config.store)?;
        store.ping(self.config.store.health_timeout()).await?;

        let router = self.router(store);
        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr).await?;

        let stop = Arc::new(Notify::new());
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown({
            let stop = stop.clone();
            async move { stop.notified().await }
        })
        .into_future();
        tokio::pin!(server);

        tracing::info!("✓ Controller ready");

        tokio::select! {
            res = &mut server => res?,
            _ = shutdown_signal() => {
                let grace = Duration::from_secs(self.config.server.shutdown_grace_secs);
                tracing::info!(grace_secs = grace.as_secs(), "Shutting down server...");
                stop.notify_one();
                match tokio::time::timeout(grace, server).await {
                    Ok(res) => res?,
                    Err(_) => tracing::warn!("grace period elapsed, dropping open connections"),
                }
            }
        }

        tracing::info!("Server exited");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
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
}
