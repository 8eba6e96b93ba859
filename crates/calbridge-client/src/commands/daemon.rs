//! Daemon command: runs the sync worker in the foreground.
//!
//! Startup order:
//! - open the database snapshot in the data directory
//! - start the calendar service, which retries accounts left offline
//! - register every configured account, keeping stored sync tokens
//! - serve the bridge on the Unix socket until SIGINT or SIGTERM
//! - flush the database snapshot

use std::future::Future;
use std::sync::Arc;

use calbridge_server::{
    CALENDAR_SERVICE, CalendarService, Emitter, ServerConfig, ServiceRegistry, SocketServer,
    WorkerBridge,
};
use calbridge_store::{Database, StoreFactory};
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Name of the database snapshot, `<data_dir>/calbridge.json`.
pub const DATABASE_NAME: &str = "calbridge";

/// Serves until a shutdown signal arrives.
pub async fn run(cli: &Cli, config: &ClientConfig) -> ClientResult<()> {
    let socket_path = cli
        .socket_path
        .clone()
        .unwrap_or_else(|| config.server.socket_path());
    let server_config = ServerConfig::new(socket_path)
        .with_data_dir(config.storage.data_dir())
        .with_max_connections(config.server.max_connections);
    serve(config, server_config, shutdown_signal()).await
}

/// Serves until `shutdown` completes.
pub async fn serve<S>(config: &ClientConfig, server_config: ServerConfig, shutdown: S) -> ClientResult<()>
where
    S: Future<Output = ()> + Send,
{
    config.validate().map_err(ClientError::Config)?;

    let database = match server_config.data_dir {
        Some(ref dir) => Database::open_at(dir, DATABASE_NAME).map_err(|e| {
            ClientError::Config(format!("failed to open database in {}: {}", dir.display(), e))
        })?,
        None => Database::open(DATABASE_NAME),
    };
    let factory = Arc::new(StoreFactory::new(database.clone()));
    let registry = Arc::new(ServiceRegistry::new());
    let emitter = Emitter::new();

    let calendar = CalendarService::builder(factory, emitter.clone())
        .start()
        .await?;
    for settings in &config.accounts {
        let mut account = settings.to_account().map_err(ClientError::Config)?;
        if let Ok(existing) = calendar.account(&account.id).await {
            account.sync_token = existing.sync_token;
        }
        info!(account = %account.id, provider = %account.provider, "account configured");
        calendar.put_account(account).await?;
    }
    registry.register(CALENDAR_SERVICE, calendar.service());

    let server = SocketServer::new(server_config).await?;
    info!(socket = %server.socket_path().display(), "daemon ready");
    server
        .run_until_shutdown(WorkerBridge::new(registry, emitter), shutdown)
        .await?;
    database
        .flush()
        .await
        .map_err(calbridge_server::ServerError::from)?;
    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
