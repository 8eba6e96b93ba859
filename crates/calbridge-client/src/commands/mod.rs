//! Subcommand implementations.

pub mod config;
pub mod daemon;
pub mod query;
pub mod sync;

use crate::bridge::BridgeClient;
use crate::cli::Cli;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Connects to the daemon and waits for it to announce its services.
pub async fn connect(cli: &Cli, config: &ClientConfig) -> ClientResult<BridgeClient> {
    let path = cli
        .socket_path
        .clone()
        .unwrap_or_else(|| config.server.socket_path());
    let client = BridgeClient::connect(&path, config.server.bridge_config())
        .await
        .map_err(|e| {
            ClientError::Connection(format!(
                "cannot reach the daemon at {} ({}); is `calbridge daemon` running?",
                path.display(),
                e
            ))
        })?;
    client.wait_ready().await?;
    Ok(client)
}

pub(crate) fn print_json(value: &serde_json::Value) -> ClientResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ClientError::Config(format!("failed to render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}
