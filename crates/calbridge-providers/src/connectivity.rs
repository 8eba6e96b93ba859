//! Network state collaborator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub online: bool,
    /// Connection is billed per byte (cellular, tethering).
    pub metered: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            online: true,
            metered: false,
        }
    }
}

/// Source of network state. The device integration lives behind this.
pub trait Connectivity: Send + Sync {
    fn state(&self) -> NetworkState;

    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// [`Connectivity`] fed by whoever observes the network.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<NetworkState>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(NetworkState::default())
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|state| {
            let changed = state.online != online;
            state.online = online;
            changed
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }

    pub fn set_metered(&self, metered: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.metered != metered;
            state.metered = metered;
            changed
        });
    }
}

impl Connectivity for ConnectivityMonitor {
    fn state(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}
