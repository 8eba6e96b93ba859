//! The worker: a dedicated OS thread running its own tokio runtime.
//!
//! The only way into the worker is the byte pipe returned by
//! [`WorkerBuilder::spawn`]. Services can be registered up front or from a
//! setup hook that runs inside the worker runtime, which is where anything
//! that spawns tasks (connectivity watchers, retry loops) must be built.
//!
//! ```rust,no_run
//! use calbridge_server::{Service, Worker};
//! use serde_json::json;
//!
//! let worker = Worker::builder()
//!     .service("echo", Service::new().method("echo", |args| async move { Ok(json!(args)) }))
//!     .spawn()
//!     .unwrap();
//! let (stream, _handle) = worker.into_parts();
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;

use calbridge_core::BoxFuture;
use tokio::io::DuplexStream;
use tracing::{error, info};

use crate::bridge::{Emitter, WorkerBridge};
use crate::config::WorkerConfig;
use crate::error::{ServerError, ServerResult};
use crate::registry::{Service, ServiceRegistry};

/// What a setup hook gets to work with.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    registry: Arc<ServiceRegistry>,
    emitter: Emitter,
    config: WorkerConfig,
}

impl WorkerContext {
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

type Setup = Box<dyn FnOnce(WorkerContext) -> BoxFuture<'static, ServerResult<()>> + Send>;

pub struct Worker {
    stream: DuplexStream,
    thread: JoinHandle<()>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("thread", &self.thread.thread().name())
            .finish()
    }
}

impl Worker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new(WorkerConfig::default())
    }

    /// The UI end of the bridge and the worker thread. The thread exits
    /// once the stream is dropped.
    pub fn into_parts(self) -> (DuplexStream, JoinHandle<()>) {
        (self.stream, self.thread)
    }
}

pub struct WorkerBuilder {
    config: WorkerConfig,
    registry: Arc<ServiceRegistry>,
    emitter: Emitter,
    setups: Vec<Setup>,
}

impl fmt::Debug for WorkerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("setups", &self.setups.len())
            .finish()
    }
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ServiceRegistry::new()),
            emitter: Emitter::new(),
            setups: Vec::new(),
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service(self, name: impl Into<String>, service: Service) -> Self {
        self.registry.register(name, service);
        self
    }

    /// Runs `setup` inside the worker runtime before the bridge starts
    /// serving. A failing hook is logged; the worker keeps running with
    /// whatever services are registered.
    pub fn setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = ServerResult<()>> + Send + 'static,
    {
        self.setups
            .push(Box::new(move |context| -> BoxFuture<'static, ServerResult<()>> {
                Box::pin(setup(context))
            }));
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Starts the worker thread.
    pub fn spawn(self) -> ServerResult<Worker> {
        let (ui, worker) = tokio::io::duplex(self.config.pipe_capacity);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads)
            .thread_name(format!("{}-rt", self.config.thread_name))
            .enable_all()
            .build()
            .map_err(|e| ServerError::worker_start(format!("runtime: {}", e)))?;

        let context = WorkerContext {
            registry: self.registry,
            emitter: self.emitter,
            config: self.config.clone(),
        };
        let setups = self.setups;
        let thread = std::thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    for setup in setups {
                        if let Err(e) = setup(context.clone()).await {
                            error!(error = %e, "worker setup failed");
                        }
                    }
                    info!(services = ?context.registry.names(), "worker started");
                    let bridge = WorkerBridge::new(context.registry.clone(), context.emitter.clone());
                    if let Err(e) = bridge.serve(worker).await {
                        error!(error = %e, "worker bridge failed");
                    }
                    info!("worker stopped");
                });
            })
            .map_err(|e| ServerError::worker_start(format!("thread: {}", e)))?;

        Ok(Worker { stream: ui, thread })
    }
}
