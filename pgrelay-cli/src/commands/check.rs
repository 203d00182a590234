//! Database reachability probe

use std::process::ExitCode;

use anyhow::{Context, Result};

use pgrelay_core::{ConnectionPool, GatewayConfig};

pub async fn run_check() -> Result<ExitCode> {
    let config = GatewayConfig::from_env().context("Invalid configuration")?;
    let pool = ConnectionPool::connect_lazy(&config.database);

    let healthy = pool.health_check().await;
    pool.close().await;

    let target = format!(
        "{}@{}:{}/{}",
        config.database.user, config.database.host, config.database.port, config.database.database
    );
    if healthy {
        println!("ok: {target}");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("unreachable: {target}");
        Ok(ExitCode::FAILURE)
    }
}
