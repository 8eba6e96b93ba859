//! `calbridge sync`: starts syncs and follows their broadcasts.

use std::collections::HashSet;
use std::sync::Arc;

use calbridge_core::PendingTracker;
use calbridge_protocol::EventName;
use calbridge_server::CALENDAR_SERVICE;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::BridgeClient;
use crate::error::{BridgeError, ClientError, ClientResult};
use crate::listener::{BroadcastListener, ListenerSpec};

/// What a followed sync reported.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Accounts whose sync this call started.
    pub started: Vec<String>,
    /// Broadcasts about those accounts, in arrival order.
    pub events: Vec<(EventName, Value)>,
}

impl SyncReport {
    pub fn count(&self, event: EventName) -> usize {
        self.events.iter().filter(|(name, _)| *name == event).count()
    }
}

/// Starts a sync of `account`, or of every account, and waits until each
/// started sync has broadcast `syncComplete`.
///
/// `on_event` sees every broadcast about the started accounts as it
/// arrives. Accounts that were already syncing, or that were skipped on a
/// metered connection, are not followed.
pub async fn sync_and_wait<F>(
    client: &BridgeClient,
    account: Option<&str>,
    tracker: &PendingTracker,
    mut on_event: F,
) -> ClientResult<SyncReport>
where
    F: FnMut(EventName, &Value),
{
    let listener = Arc::new(BroadcastListener::new(
        ListenerSpec::sync(),
        Some(tracker.clone()),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    for event in listener.spec().events.clone() {
        let tx = tx.clone();
        listener
            .on(event, move |payload| {
                let _ = tx.send((event, payload.clone()));
            })
            .map_err(|e| ClientError::Config(e.to_string()))?;
    }
    drop(tx);
    let attached = listener.attach(client);
    drop(listener);

    let started: Vec<String> = match account {
        Some(id) => {
            let started: bool = client
                .call(CALENDAR_SERVICE, "sync", vec![json!(id)])
                .await?;
            if started { vec![id.to_string()] } else { Vec::new() }
        }
        None => client.call(CALENDAR_SERVICE, "syncAll", Vec::new()).await?,
    };
    debug!(?started, "syncs started");

    let mut report = SyncReport {
        started: started.clone(),
        events: Vec::new(),
    };
    let mut remaining: HashSet<String> = started.into_iter().collect();
    while !remaining.is_empty() {
        let Some((event, payload)) = rx.recv().await else {
            attached.abort();
            return Err(BridgeError::TransportClosed.into());
        };
        let Some(account_id) = payload["account_id"].as_str().map(str::to_string) else {
            continue;
        };
        if !report.started.contains(&account_id) {
            continue;
        }
        on_event(event, &payload);
        if event == EventName::SyncComplete {
            remaining.remove(&account_id);
        }
        report.events.push((event, payload));
    }
    attached.abort();
    Ok(report)
}

/// Runs the subcommand, printing one JSON line per broadcast.
pub async fn run(client: &BridgeClient, account: Option<&str>) -> ClientResult<()> {
    let tracker = PendingTracker::new();
    tracker.on_transition(|transition| debug!(?transition, "sync activity"));
    let report = sync_and_wait(client, account, &tracker, |event, payload| {
        println!("{}", json!({ "event": event, "payload": payload }));
    })
    .await?;

    if report.started.is_empty() {
        println!("Nothing to sync.");
    } else if report.count(EventName::SyncError) + report.count(EventName::SyncOffline) > 0 {
        return Err(ClientError::Connection(format!(
            "{} of {} sync(s) did not complete cleanly",
            report.count(EventName::SyncError) + report.count(EventName::SyncOffline),
            report.started.len()
        )));
    }
    Ok(())
}
