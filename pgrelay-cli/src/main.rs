//! pgrelay - Postgres query and LISTEN/NOTIFY gateway over gRPC
//!
//! - `serve`: run the gateway
//! - `check`: probe the configured database
//! - `query` / `listen`: call a running gateway

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "pgrelay",
    author,
    version,
    about = "Postgres query and LISTEN/NOTIFY gateway over gRPC",
    long_about = "Expose parameterized query execution and live LISTEN/NOTIFY streams \
                  to remote callers through a single gRPC service. Database settings come \
                  from DB_* environment variables (a .env file is loaded if present)."
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway (blocks until SIGTERM/Ctrl+C)
    Serve(commands::serve::ServeArgs),
    /// Check that the configured database answers a trivial query
    Check,
    /// Execute a query through a running gateway
    Query(commands::client::QueryArgs),
    /// Stream notifications for a channel from a running gateway
    Listen(commands::client::ListenArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_setup::init(&tracing_setup::TracingConfig { debug: cli.debug }).ok();

    match cli.command {
        Commands::Serve(args) => commands::run_serve(args).await,
        Commands::Check => commands::run_check().await,
        Commands::Query(args) => commands::run_query(args).await,
        Commands::Listen(args) => commands::run_listen(args).await,
    }
}
