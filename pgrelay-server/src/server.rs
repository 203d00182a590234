//! gRPC server setup
//!
//! - Serves `DB.DBService` on the configured address
//! - On SIGTERM/Ctrl+C drains every subscription and closes the pool
//!   before the transport finishes its graceful shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use pgrelay_core::{Gateway, ShutdownReport};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::proto::DbServiceServer;
use crate::service::DbServiceImpl;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0:50051)
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], pgrelay_core::config::DEFAULT_SERVICE_PORT)),
        }
    }
}

/// Run the gRPC server until a termination signal arrives.
///
/// Returns the shutdown report; its pool-close outcome decides the exit status.
///
/// # Example
///
/// ```ignore
/// let gateway = Arc::new(Gateway::connect(&config).await?);
/// let report = run_server(gateway, ServerConfig::default()).await?;
/// ```
pub async fn run_server(
    gateway: Arc<Gateway>,
    config: ServerConfig,
) -> Result<ShutdownReport, ServerError> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    serve(gateway, listener, shutdown_signal()).await
}

/// Serve on an already bound listener until `signal` resolves.
pub async fn serve<F>(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    signal: F,
) -> Result<ShutdownReport, ServerError>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener.local_addr()?;
    let coordinator = gateway.shutdown_coordinator();
    let (report_tx, report_rx) = oneshot::channel();

    // Live streams would hold the transport's graceful shutdown open, so
    // the relays are drained before the transport is told to stop.
    let shutdown = async move {
        signal.await;
        let report = coordinator.shutdown().await;
        let _ = report_tx.send(report);
    };

    tracing::info!("Server listening on {}", addr);

    Server::builder()
        .add_service(DbServiceServer::new(DbServiceImpl::new(gateway)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;

    let report = report_rx.await.map_err(|_| ServerError::ShutdownAborted)?;
    tracing::info!(
        drained = report.drained,
        failed = report.failed.len(),
        "Server shutdown complete"
    );
    Ok(report)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting shutdown");
        }
    }
}

/// Server error type
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("server stopped before shutdown finished")]
    ShutdownAborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 50051);
    }
}
