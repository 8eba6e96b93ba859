//! Calendar providers.
//!
//! - [`CalendarProvider`] - the trait every account backend implements
//! - [`LocalProvider`] - device-only calendar, no network
//! - [`RemoteProvider`] - server-backed accounts, driving a [`RemoteClient`]
//! - [`SyncStream`] - cancellable stream of [`SyncEvent`]s
//! - [`ProviderError`] - failure taxonomy shared with the worker
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   ┌────────────────────┐
//! │ LocalProvider │   │ RemoteProvider<C>  │──── RemoteClient (CalDavClient)
//! └───────┬───────┘   └─────────┬──────────┘
//!         │  CalendarProvider   │
//!         └──────────┬──────────┘
//!                    ▼
//!             EventStores ──── recurrence expansion
//!                    │
//!                    ▼
//!              StoreFactory
//! ```

#[cfg(feature = "caldav")]
pub mod caldav;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod ical;
pub mod local;
pub mod persist;
pub mod provider;
pub mod recurrence;
pub mod remote;
pub mod stream;

pub use config::SyncConfig;
pub use connectivity::{Connectivity, ConnectivityMonitor, NetworkState};
pub use error::{ProviderError, ProviderErrorCode, ProviderResult};
pub use local::{LOCAL_CALENDAR_ID, LocalProvider};
pub use persist::EventStores;
pub use provider::{CalendarProvider, CapabilitySet, build_provider};
pub use recurrence::{Occurrence, expand_occurrences};
pub use remote::{
    ChangeSet, FetchChanges, PushOp, RemoteCalendar, RemoteClient, RemoteEvent, RemoteProvider,
    ServerFeatures,
};
pub use stream::{SyncEvent, SyncSender, SyncStream};
