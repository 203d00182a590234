//! gRPC client commands against a running gateway
//!
//! `query` prints one JSON object; `listen` prints one JSON line per
//! notification until the stream ends or Ctrl+C.

use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tonic::transport::Channel;

use pgrelay_server::proto::{ChannelRequest, ChannelResponse, StoredProcRequest};
use pgrelay_server::DbServiceClient;

#[derive(Parser, Debug)]
pub struct ClientArgs {
    /// Gateway address
    #[arg(long, env = "PGRELAY_ADDR", default_value = "http://127.0.0.1:50051")]
    pub addr: String,
}

impl ClientArgs {
    async fn connect(&self) -> Result<DbServiceClient<Channel>> {
        DbServiceClient::connect(self.addr.clone())
            .await
            .with_context(|| format!("Failed to connect to {}", self.addr))
    }
}

#[derive(Parser, Debug)]
pub struct QueryArgs {
    /// SQL to execute ($1, $2, ... for parameters)
    pub sql: String,

    /// Positional parameter (repeatable); JSON values are decoded, long
    /// base64 strings are sent as bytes
    #[arg(long = "param", short = 'p', value_name = "VALUE")]
    pub params: Vec<String>,

    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(Parser, Debug)]
pub struct ListenArgs {
    /// Channel to subscribe to
    pub channel: String,

    #[command(flatten)]
    pub client: ClientArgs,
}

/// Printed by `query`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryOutput {
    command: String,
    row_count: i32,
    rows: Value,
}

/// One line printed by `listen`; `data` is decoded when it is JSON
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationLine {
    channel_name: String,
    data: Value,
    timestamp: String,
}

impl From<ChannelResponse> for NotificationLine {
    fn from(event: ChannelResponse) -> Self {
        let data = serde_json::from_str(&event.data).unwrap_or(Value::String(event.data));
        Self {
            channel_name: event.channel_name,
            data,
            timestamp: event.timestamp,
        }
    }
}

pub async fn run_query(args: QueryArgs) -> Result<ExitCode> {
    let mut client = args.client.connect().await?;

    let response = client
        .execute_query(StoredProcRequest {
            query: args.sql,
            params: args.params,
        })
        .await
        .map_err(|status| anyhow!("{:?}: {}", status.code(), status.message()))?
        .into_inner();

    let rows: Value =
        serde_json::from_str(&response.result).context("Gateway returned malformed rows")?;
    let output = QueryOutput {
        command: response.command,
        row_count: response.row_count,
        rows,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(ExitCode::SUCCESS)
}

pub async fn run_listen(args: ListenArgs) -> Result<ExitCode> {
    let mut client = args.client.connect().await?;

    let mut stream = client
        .listen_to_channel(ChannelRequest {
            channel_name: args.channel.clone(),
        })
        .await
        .map_err(|status| anyhow!("{:?}: {}", status.code(), status.message()))?
        .into_inner();

    tracing::info!(channel = %args.channel, "Listening, Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing subscription");
                break;
            }
            message = stream.message() => match message {
                Ok(Some(event)) => {
                    println!("{}", serde_json::to_string(&NotificationLine::from(event))?);
                }
                Ok(None) => {
                    tracing::info!("Gateway closed the stream");
                    break;
                }
                Err(status) => {
                    return Err(anyhow!("{:?}: {}", status.code(), status.message()));
                }
            },
        }
    }

    Ok(ExitCode::SUCCESS)
}
