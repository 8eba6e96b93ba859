//! Typed fan-out of worker broadcasts.
//!
//! A [`BroadcastListener`] declares the events it accepts. Subscribing to an
//! undeclared event is an error; receiving one is ignored. With
//! `pending` set, the start and complete events drive a [`PendingTracker`]
//! before any callback runs, so a UI can show one busy indicator for all
//! running syncs.
//!
//! Starts are counted per `account_id`. A completion only settles a start
//! this listener saw, and starts still open when the broadcast stream ends
//! are settled then.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use calbridge_core::PendingTracker;
use calbridge_protocol::EventName;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::bridge::BridgeClient;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("event {0} is not declared by this listener")]
    UnknownEvent(String),
}

/// Handle returned by [`BroadcastListener::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What a listener accepts and how it drives the pending counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub events: Vec<EventName>,
    pub start_event: Option<EventName>,
    pub complete_event: Option<EventName>,
    pub pending: bool,
}

impl ListenerSpec {
    /// Sync lifecycle: `syncStart` through `syncComplete`.
    pub fn sync() -> Self {
        Self {
            events: vec![
                EventName::SyncStart,
                EventName::SyncComplete,
                EventName::SyncError,
                EventName::SyncOffline,
                EventName::SyncProgress,
            ],
            start_event: Some(EventName::SyncStart),
            complete_event: Some(EventName::SyncComplete),
            pending: true,
        }
    }

    /// Occurrence expansion: `expandStart` through `expandComplete`.
    pub fn expand() -> Self {
        Self {
            events: vec![EventName::ExpandStart, EventName::ExpandComplete],
            start_event: Some(EventName::ExpandStart),
            complete_event: Some(EventName::ExpandComplete),
            pending: true,
        }
    }

    pub fn declares(&self, event: EventName) -> bool {
        self.events.contains(&event)
    }
}

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

pub struct BroadcastListener {
    spec: ListenerSpec,
    tracker: Option<PendingTracker>,
    subscribers: Mutex<HashMap<EventName, Vec<(SubscriptionId, Callback)>>>,
    outstanding: Mutex<HashMap<String, usize>>,
    next_id: AtomicU64,
}

impl fmt::Debug for BroadcastListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastListener")
            .field("spec", &self.spec)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl BroadcastListener {
    /// `tracker` is only driven when `spec.pending` is set.
    pub fn new(spec: ListenerSpec, tracker: Option<PendingTracker>) -> Self {
        Self {
            spec,
            tracker,
            subscribers: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    /// Calls `callback` with the payload of every `event`, after the
    /// callbacks registered before it.
    pub fn on<F>(&self, event: EventName, callback: F) -> Result<SubscriptionId, ListenerError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if !self.spec.declares(event) {
            error!(%event, "subscription to undeclared event");
            return Err(ListenerError::UnknownEvent(event.to_string()));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push((id, Arc::new(callback)));
        Ok(id)
    }

    /// [`on`](Self::on) with the event given by its wire name.
    pub fn on_named<F>(&self, event: &str, callback: F) -> Result<SubscriptionId, ListenerError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let Ok(parsed) = EventName::from_str(event) else {
            error!(event, "subscription to unknown event");
            return Err(ListenerError::UnknownEvent(event.to_string()));
        };
        self.on(parsed, callback)
    }

    pub fn off(&self, event: EventName, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get_mut(&event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    /// Delivers one broadcast.
    pub fn dispatch(&self, event: EventName, payload: &Value) {
        if !self.spec.declares(event) {
            debug!(%event, "undeclared broadcast ignored");
            return;
        }
        if self.spec.pending
            && let Some(tracker) = &self.tracker
        {
            let key = payload["account_id"].as_str().unwrap_or_default();
            if self.spec.start_event == Some(event) {
                *self.outstanding().entry(key.to_string()).or_default() += 1;
                tracker.increment();
            } else if self.spec.complete_event == Some(event) {
                if self.settle(key) {
                    // Underflow is already reported by the tracker.
                    let _ = tracker.decrement();
                } else {
                    debug!(%event, account = key, "completion without a start ignored");
                }
            }
        }

        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map(|list| list.iter().map(|(_, callback)| callback.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(payload);
        }
    }

    /// Settles every start still waiting for its completion. Returns how
    /// many were settled.
    pub fn release_outstanding(&self) -> usize {
        let open: usize = self.outstanding().drain().map(|(_, count)| count).sum();
        if open == 0 {
            return 0;
        }
        debug!(count = open, "settling starts without completion");
        if let Some(tracker) = &self.tracker {
            for _ in 0..open {
                let _ = tracker.decrement();
            }
        }
        open
    }

    /// Starts seen without their completion yet.
    pub fn outstanding_starts(&self) -> usize {
        self.outstanding().values().sum()
    }

    /// Feeds every broadcast `client` receives from now on into
    /// [`dispatch`](Self::dispatch). The task ends with the bridge and
    /// then settles the starts that never completed.
    pub fn attach(self: &Arc<Self>, client: &BridgeClient) -> JoinHandle<()> {
        let mut broadcasts = client.subscribe();
        let listener = self.clone();
        tokio::spawn(async move {
            while let Some(broadcast) = broadcasts.recv().await {
                listener.dispatch(broadcast.event, &broadcast.payload);
            }
            listener.release_outstanding();
            debug!("listener detached");
        })
    }

    fn settle(&self, key: &str) -> bool {
        let mut outstanding = self.outstanding();
        let Some(count) = outstanding.get_mut(key) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            outstanding.remove(key);
        }
        true
    }

    fn outstanding(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BroadcastListener {
    fn drop(&mut self) {
        self.release_outstanding();
    }
}
