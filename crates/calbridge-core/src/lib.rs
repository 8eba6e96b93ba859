//! Core types shared by every calbridge crate.
//!
//! - [`entity`]: the stored records and the closed [`EntityKind`] vocabulary
//! - [`pending`]: the process-wide pending-operation tracker
//! - [`time`]: event times and query windows
//! - [`tracing`]: logging setup

pub mod entity;
pub mod pending;
pub mod time;
pub mod tracing;

use std::future::Future;
use std::pin::Pin;

pub use entity::{
    Account, Alarm, Busytime, Calendar, Credentials, Entity, EntityKind, Event, EventOverride,
    IcalComponent, ProviderKind, Setting, UnknownKind,
};
pub use pending::{ObserverId, PendingError, PendingGuard, PendingTracker, PendingTransition};
pub use time::{EventTime, TimeWindow};
pub use self::tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};

/// Boxed future used by the object-safe async traits across the workspace.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
