//! Gateway server command
//!
//! Loads DB_* settings, verifies the database answers, then serves
//! `DB.DBService` until SIGTERM/Ctrl+C.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use pgrelay_core::{ConnectionPool, Gateway, GatewayConfig};
use pgrelay_server::{run_server, ServerConfig};

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on (overrides PORT, default: 50051)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
}

/// Run the gateway. Exits non-zero when the startup health check or the
/// final pool close fails.
pub async fn run_serve(args: ServeArgs) -> Result<ExitCode> {
    let config = GatewayConfig::from_env().context("Invalid configuration")?;
    let bind_addr = SocketAddr::new(args.host, args.port.unwrap_or(config.port));

    let pool = Arc::new(ConnectionPool::connect_lazy(&config.database));
    if !pool.health_check().await {
        tracing::error!(
            host = %config.database.host,
            database = %config.database.database,
            "Database health check failed, not starting"
        );
        pool.close().await;
        return Ok(ExitCode::FAILURE);
    }
    tracing::info!("Database connection verified");

    let gateway = Arc::new(Gateway::new(pool, &config));

    tracing::info!("Starting pgrelay on {}", bind_addr);

    // Run server (blocks until shutdown)
    let report = run_server(gateway, ServerConfig { bind_addr })
        .await
        .context("Server error")?;

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
