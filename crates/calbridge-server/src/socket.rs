//! Unix socket listener for daemon mode.
//!
//! Each accepted connection is served by its own [`WorkerBridge`] over the
//! shared registry and emitter, so every connected client sees the same
//! services and receives every broadcast.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::bridge::WorkerBridge;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

pub struct SocketServer {
    config: ServerConfig,
    listener: UnixListener,
    connection_semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("config", &self.config)
            .field("available", &self.connection_semaphore.available_permits())
            .finish()
    }
}

impl SocketServer {
    /// Binds the configured socket path.
    ///
    /// An existing file at the path is removed when nothing answers on it
    /// and `cleanup_stale_socket` is set; otherwise binding fails with
    /// [`ServerError::SocketInUse`].
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        let socket_path = &config.socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if config.cleanup_stale_socket && socket_path.exists() {
            match UnixStream::connect(socket_path).await {
                Ok(_) => {
                    return Err(ServerError::socket_in_use(
                        socket_path.to_string_lossy().to_string(),
                    ));
                }
                Err(_) => {
                    info!(path = %socket_path.display(), "removing stale socket");
                    std::fs::remove_file(socket_path)?;
                }
            }
        } else if socket_path.exists() {
            return Err(ServerError::socket_in_use(
                socket_path.to_string_lossy().to_string(),
            ));
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "socket server listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Ok(Self {
            config,
            listener,
            connection_semaphore,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Waits for a free connection slot, then for a client.
    pub async fn accept(&self) -> ServerResult<(UnixStream, OwnedSemaphorePermit)> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("connection limiter closed"))?;
        let (stream, _addr) = self.listener.accept().await?;
        debug!("accepted connection");
        Ok((stream, permit))
    }

    /// Serves every accepted connection with a clone of `bridge`.
    pub async fn run(&self, bridge: WorkerBridge) -> ServerResult<()> {
        loop {
            match self.accept().await {
                Ok((stream, permit)) => {
                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.serve(stream).await {
                            warn!(error = %e, "connection ended with error");
                        }
                        debug!("connection closed");
                        drop(permit);
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            }
        }
    }

    /// Like [`run`](Self::run), returning once `shutdown` completes.
    pub async fn run_until_shutdown<S>(&self, bridge: WorkerBridge, shutdown: S) -> ServerResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(bridge) => result,
            _ = shutdown => {
                info!("shutdown signal received");
                Ok(())
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let path = &self.config.socket_path;
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove socket file");
            } else {
                debug!(path = %path.display(), "removed socket file");
            }
        }
    }
}
