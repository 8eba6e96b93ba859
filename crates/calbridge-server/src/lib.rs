//! Worker: service registry, bridge transport, calendar service.
//!
//! This crate provides the worker side of calbridge:
//! - [`ServiceRegistry`] and [`Service`] handler tables
//! - [`WorkerBridge`], which serves the registry over any byte stream
//! - [`Worker`], a dedicated thread with its own runtime behind an
//!   in-process pipe
//! - [`CalendarService`], which runs provider syncs and broadcasts their
//!   lifecycle
//! - [`SocketServer`] for daemon mode
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use calbridge_server::{CALENDAR_SERVICE, CalendarService, Worker};
//! use calbridge_store::{Database, StoreFactory};
//!
//! let worker = Worker::builder()
//!     .setup(|context| async move {
//!         let factory = Arc::new(StoreFactory::new(Database::open("calbridge")));
//!         let calendar = CalendarService::builder(factory, context.emitter().clone())
//!             .start()
//!             .await?;
//!         context.registry().register(CALENDAR_SERVICE, calendar.service());
//!         Ok(())
//!     })
//!     .spawn()
//!     .unwrap();
//! ```

mod bridge;
mod calendar_service;
mod config;
mod error;
mod registry;
mod retry;
#[cfg(unix)]
mod socket;
mod worker;

pub use bridge::{Emitter, WorkerBridge};
pub use calendar_service::{
    CALENDAR_SERVICE, CalendarService, CalendarServiceBuilder, ProviderBuilder,
};
pub use config::{ServerConfig, WorkerConfig, default_socket_path};
pub use error::{ServerError, ServerResult, error_code, provider_rejection, store_rejection};
pub use registry::{HandlerFuture, HandlerResult, Service, ServiceRegistry, arg, arg_str};
pub use retry::OfflineRetry;
#[cfg(unix)]
pub use socket::SocketServer;
pub use worker::{Worker, WorkerBuilder, WorkerContext};
