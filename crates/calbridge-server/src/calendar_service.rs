//! The `calendar` service.
//!
//! Owns one provider per account and runs their syncs as worker tasks.
//! Sync progress never travels in responses: a `sync` call answers as soon
//! as the run is started and everything after that is broadcast
//! (`syncStart`, `syncProgress`, `syncError`/`syncOffline`, `syncComplete`).
//! Every run that emitted `syncStart` emits `syncComplete`, including runs
//! that fail or are cancelled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use calbridge_core::{Account, BoxFuture, Calendar, Event, Setting};
use calbridge_protocol::{ErrorResponse, EventName};
use calbridge_providers::{
    CalendarProvider, Connectivity, ConnectivityMonitor, EventStores, ProviderError,
    ProviderResult, SyncConfig, SyncEvent, build_provider,
};
use calbridge_store::settings::keys;
use calbridge_store::{Store, StoreFactory, StoreSettings};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::bridge::Emitter;
use crate::error::{ServerResult, error_code, provider_rejection, store_rejection};
use crate::registry::{HandlerResult, Service, arg, arg_str};
use crate::retry::{self, OfflineRetry};

/// Name the service is registered under.
pub const CALENDAR_SERVICE: &str = "calendar";

/// Constructs the provider of an account.
pub type ProviderBuilder = Arc<
    dyn Fn(
            Account,
            Arc<StoreFactory>,
            SyncConfig,
            Arc<dyn Connectivity>,
        ) -> BoxFuture<'static, ProviderResult<Arc<dyn CalendarProvider>>>
        + Send
        + Sync,
>;

fn default_provider_builder() -> ProviderBuilder {
    Arc::new(|account, factory, config, connectivity| {
        Box::pin(async move { build_provider(&account, &factory, config, connectivity).await })
    })
}

pub struct CalendarServiceBuilder {
    factory: Arc<StoreFactory>,
    emitter: Emitter,
    connectivity: Arc<dyn Connectivity>,
    sync: SyncConfig,
    providers: ProviderBuilder,
}

impl fmt::Debug for CalendarServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalendarServiceBuilder")
            .field("sync", &self.sync)
            .field("network", &self.connectivity.state())
            .finish()
    }
}

impl CalendarServiceBuilder {
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn sync_config(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Replaces [`build_provider`] as the way accounts get their provider.
    pub fn provider_builder<F, Fut>(mut self, build: F) -> Self
    where
        F: Fn(Account, Arc<StoreFactory>, SyncConfig, Arc<dyn Connectivity>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ProviderResult<Arc<dyn CalendarProvider>>> + Send + 'static,
    {
        self.providers = Arc::new(move |account, factory, config, connectivity| {
            Box::pin(build(account, factory, config, connectivity))
        });
        self
    }

    /// Loads the offline retry set, starts watching connectivity and, when
    /// already online, retries whatever the previous run left queued.
    ///
    /// Must be called inside the worker runtime.
    pub async fn start(self) -> ServerResult<Arc<CalendarService>> {
        let accounts = self.factory.store::<Account>().await?;
        let settings = StoreSettings::new(self.factory.store::<Setting>().await?);
        let retry = OfflineRetry::load(settings.clone()).await?;

        let service = Arc::new(CalendarService {
            factory: self.factory,
            accounts,
            settings,
            connectivity: self.connectivity,
            emitter: self.emitter,
            sync: self.sync,
            build: self.providers,
            providers: tokio::sync::Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            runs: AtomicU64::new(0),
            retry,
            watcher: Mutex::new(None),
        });

        let watcher =
            retry::watch_connectivity(Arc::downgrade(&service), service.connectivity.subscribe());
        *service.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);

        if service.connectivity.state().online {
            service.retry_offline().await;
        }
        Ok(service)
    }
}

struct RunningSync {
    run: u64,
    task: AbortHandle,
}

/// Emits the start event now and the complete event when dropped.
struct Lifecycle {
    emitter: Emitter,
    complete: EventName,
    payload: Value,
}

impl Lifecycle {
    fn begin(emitter: &Emitter, start: EventName, complete: EventName, payload: Value) -> Self {
        emitter.emit(start, payload.clone());
        Self {
            emitter: emitter.clone(),
            complete,
            payload,
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.emitter
            .emit(self.complete, std::mem::take(&mut self.payload));
    }
}

pub struct CalendarService {
    factory: Arc<StoreFactory>,
    accounts: Arc<Store<Account>>,
    settings: StoreSettings,
    connectivity: Arc<dyn Connectivity>,
    emitter: Emitter,
    sync: SyncConfig,
    build: ProviderBuilder,
    providers: tokio::sync::Mutex<HashMap<String, Arc<dyn CalendarProvider>>>,
    running: Mutex<HashMap<String, RunningSync>>,
    runs: AtomicU64,
    retry: OfflineRetry,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CalendarService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalendarService")
            .field("syncing", &self.syncing())
            .field("network", &self.connectivity.state())
            .finish()
    }
}

impl Drop for CalendarService {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        for (_, running) in self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            running.task.abort();
        }
    }
}

impl CalendarService {
    pub fn builder(factory: Arc<StoreFactory>, emitter: Emitter) -> CalendarServiceBuilder {
        CalendarServiceBuilder {
            factory,
            emitter,
            connectivity: Arc::new(ConnectivityMonitor::default()),
            sync: SyncConfig::default(),
            providers: default_provider_builder(),
        }
    }

    /// The handler table to register under [`CALENDAR_SERVICE`].
    pub fn service(self: &Arc<Self>) -> Service {
        Service::new()
            .method_with_arity("listAccounts", 0, bind(self, |svc, _| async move {
                reply(svc.list_accounts().await?)
            }))
            .method_with_arity("getAccount", 1, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                reply(redacted(svc.account(&id).await?))
            }))
            .method_with_arity("putAccount", 1, bind(self, |svc, args| async move {
                let account: Account = arg(&args, 0, "account")?;
                svc.put_account(account).await?;
                Ok(Value::Null)
            }))
            .method_with_arity("removeAccount", 1, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                reply(svc.remove_account(&id).await?)
            }))
            .method_with_arity("findCalendars", 1, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                reply(svc.find_calendars(&id).await?)
            }))
            .method_with_arity("getCapabilities", 1, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                let provider = svc.provider_for(&id).await?;
                reply(provider.capabilities().await.map_err(provider_rejection)?)
            }))
            .method_with_arity("sync", 1, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                reply(svc.start_sync(&id).await?)
            }))
            .method_with_arity("syncAll", 0, bind(self, |svc, _| async move {
                reply(svc.sync_all().await?)
            }))
            .method_with_arity("cancelSync", 1, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                reply(svc.cancel_sync(&id))
            }))
            .method_with_arity("createEvent", 2, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                let event: Event = arg(&args, 1, "event")?;
                let provider = svc.provider_for(&id).await?;
                reply(provider.create_event(event).await.map_err(provider_rejection)?)
            }))
            .method_with_arity("updateEvent", 2, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                let event: Event = arg(&args, 1, "event")?;
                let provider = svc.provider_for(&id).await?;
                reply(provider.update_event(event).await.map_err(provider_rejection)?)
            }))
            .method_with_arity("deleteEvent", 2, bind(self, |svc, args| async move {
                let id = arg_str(&args, 0, "accountId")?;
                let event_id = arg_str(&args, 1, "eventId")?;
                let provider = svc.provider_for(&id).await?;
                provider
                    .delete_event(&event_id)
                    .await
                    .map_err(provider_rejection)?;
                Ok(Value::Null)
            }))
            .method_with_arity("expand", 0, bind(self, |svc, _| async move {
                reply(svc.expand().await?)
            }))
            .method_with_arity("get", 2, bind(self, |svc, args| async move {
                let kind = arg_str(&args, 0, "kind")?;
                let id = arg_str(&args, 1, "id")?;
                let store = svc.factory.get_store_named(&kind).await.map_err(store_rejection)?;
                let record = store.get_json(&id).await.map_err(store_rejection)?;
                Ok(record.map(strip_credentials).unwrap_or(Value::Null))
            }))
            .method_with_arity("list", 1, bind(self, |svc, args| async move {
                let kind = arg_str(&args, 0, "kind")?;
                let store = svc.factory.get_store_named(&kind).await.map_err(store_rejection)?;
                let records = store.all_json().await.map_err(store_rejection)?;
                reply(records.into_iter().map(strip_credentials).collect::<Vec<_>>())
            }))
            .method_with_arity("status", 0, bind(self, |svc, _| async move {
                svc.status().await
            }))
    }

    pub async fn account(&self, id: &str) -> Result<Account, ErrorResponse> {
        self.accounts
            .get(id)
            .await
            .map_err(store_rejection)?
            .ok_or_else(|| ErrorResponse::not_found(format!("no account '{}'", id)))
    }

    /// Accounts without their credentials.
    pub async fn list_accounts(&self) -> ServerResult<Vec<Account>> {
        let mut accounts: Vec<Account> =
            self.accounts.all().await?.into_iter().map(redacted).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    /// Stores `account` and drops its cached provider so the next call
    /// builds one from the new settings.
    pub async fn put_account(&self, account: Account) -> ServerResult<()> {
        self.accounts.persist(&account).await?;
        self.providers.lock().await.remove(&account.id);
        info!(account = %account.id, provider = %account.provider, "account saved");
        Ok(())
    }

    /// Removes the account together with its calendars and their events.
    pub async fn remove_account(&self, id: &str) -> ServerResult<bool> {
        self.cancel_sync(id);
        self.providers.lock().await.remove(id);

        let stores = EventStores::from_factory(&self.factory, self.sync.clone()).await?;
        let calendars = stores.calendars.all().await?;
        for calendar in calendars.iter().filter(|c| c.account_id == id) {
            for event in stores.events_in_calendar(&calendar.id).await? {
                stores.remove_event(&event.id).await?;
            }
            stores.calendars.remove(&calendar.id).await?;
        }
        let existed = self.accounts.remove(id).await?;
        if existed {
            info!(account = %id, "account removed");
        }
        Ok(existed)
    }

    pub async fn find_calendars(&self, account_id: &str) -> Result<Vec<Calendar>, ErrorResponse> {
        let account = self.account(account_id).await?;
        let provider = self.provider(&account).await.map_err(provider_rejection)?;
        provider
            .find_calendars(&account)
            .await
            .map_err(provider_rejection)
    }

    /// Starts a sync of `account_id` in the background.
    ///
    /// Returns `false` without broadcasting anything when the account is
    /// already syncing or when the network is metered and `syncOnMetered`
    /// is off.
    pub async fn start_sync(self: &Arc<Self>, account_id: &str) -> Result<bool, ErrorResponse> {
        let account = self.account(account_id).await?;
        if self.connectivity.state().metered
            && !self
                .settings
                .get_bool(keys::SYNC_ON_METERED, true)
                .await
                .map_err(store_rejection)?
        {
            info!(account = %account_id, "metered network, sync skipped");
            return Ok(false);
        }

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains_key(account_id) {
            debug!(account = %account_id, "sync already running");
            return Ok(false);
        }
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(self.clone().run_sync(account, run));
        running.insert(
            account_id.to_string(),
            RunningSync {
                run,
                task: task.abort_handle(),
            },
        );
        Ok(true)
    }

    /// Starts every account's sync; returns the ids that started.
    pub async fn sync_all(self: &Arc<Self>) -> ServerResult<Vec<String>> {
        let mut started = Vec::new();
        for account in self.accounts.all().await? {
            match self.start_sync(&account.id).await {
                Ok(true) => started.push(account.id),
                Ok(false) => {}
                Err(e) => warn!(account = %account.id, error = %e, "sync not started"),
            }
        }
        Ok(started)
    }

    /// Aborts a running sync. Its `syncComplete` still goes out.
    pub fn cancel_sync(&self, account_id: &str) -> bool {
        let entry = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(account_id);
        match entry {
            Some(running) => {
                running.task.abort();
                info!(account = %account_id, "sync cancelled");
                true
            }
            None => false,
        }
    }

    /// Accounts with a sync in flight, sorted.
    pub fn syncing(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Syncs each account queued while offline, once.
    pub async fn retry_offline(self: &Arc<Self>) {
        let accounts = match self.retry.take().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "could not read offline retry set");
                return;
            }
        };
        for id in accounts {
            match self.start_sync(&id).await {
                Ok(started) => info!(account = %id, started, "offline retry"),
                Err(e) => warn!(account = %id, error = %e, "offline retry dropped"),
            }
        }
    }

    /// Rematerializes busytimes and alarms of every stored event for the
    /// current window.
    pub async fn expand(&self) -> ServerResult<usize> {
        let _lifecycle = Lifecycle::begin(
            &self.emitter,
            EventName::ExpandStart,
            EventName::ExpandComplete,
            json!({}),
        );
        let stores = EventStores::from_factory(&self.factory, self.sync.clone()).await?;
        let mut expanded = 0;
        for event in stores.events.all().await? {
            let Some(component) = stores.components.get(&event.id).await? else {
                debug!(event = %event.id, "no raw component, skipped");
                continue;
            };
            stores.write_event(&event, &component.ical).await?;
            expanded += 1;
        }
        info!(expanded, "occurrences rematerialized");
        Ok(expanded)
    }

    pub async fn status(&self) -> HandlerResult {
        let network = self.connectivity.state();
        let accounts = self.accounts.all().await.map_err(store_rejection)?.len();
        Ok(json!({
            "online": network.online,
            "metered": network.metered,
            "accounts": accounts,
            "syncing": self.syncing(),
            "offline_retry": self.retry.accounts().await,
        }))
    }

    async fn provider_for(
        &self,
        account_id: &str,
    ) -> Result<Arc<dyn CalendarProvider>, ErrorResponse> {
        let account = self.account(account_id).await?;
        self.provider(&account).await.map_err(provider_rejection)
    }

    async fn provider(&self, account: &Account) -> ProviderResult<Arc<dyn CalendarProvider>> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&account.id) {
            return Ok(provider.clone());
        }
        let provider = (self.build)(
            account.clone(),
            self.factory.clone(),
            self.sync.clone(),
            self.connectivity.clone(),
        )
        .await?;
        debug!(account = %account.id, kind = %provider.kind(), "provider built");
        providers.insert(account.id.clone(), provider.clone());
        Ok(provider)
    }

    async fn run_sync(self: Arc<Self>, account: Account, run: u64) {
        let account_id = account.id.clone();
        let _lifecycle = Lifecycle::begin(
            &self.emitter,
            EventName::SyncStart,
            EventName::SyncComplete,
            json!({ "account_id": account_id }),
        );
        match self.drive_sync(account).await {
            Ok(synced) => info!(account = %account_id, synced, "sync finished"),
            Err(e) => self.report_failure(&account_id, e).await,
        }
        self.finish_run(&account_id, run);
    }

    async fn drive_sync(&self, account: Account) -> ProviderResult<usize> {
        let provider = self.provider(&account).await?;
        let mut stream = provider.sync(account.clone());
        let mut synced = 0;
        while let Some(item) = stream.next().await {
            match item? {
                SyncEvent::Started => debug!(account = %account.id, "provider sync started"),
                SyncEvent::ItemSynced(count) => {
                    synced = count;
                    self.emitter.emit(
                        EventName::SyncProgress,
                        json!({ "account_id": account.id, "synced": count }),
                    );
                }
                SyncEvent::Completed(token) => self.store_token(&account.id, token).await?,
            }
        }
        Ok(synced)
    }

    async fn store_token(&self, account_id: &str, token: Option<String>) -> ProviderResult<()> {
        let Some(mut account) = self.accounts.get(account_id).await? else {
            return Ok(());
        };
        if account.sync_token != token {
            account.sync_token = token;
            self.accounts.persist(&account).await?;
        }
        Ok(())
    }

    async fn report_failure(&self, account_id: &str, error: ProviderError) {
        if error.is_offline() {
            warn!(account = %account_id, error = %error, "sync deferred until back online");
            if let Err(e) = self.retry.add(account_id).await {
                error!(account = %account_id, error = %e, "could not queue offline retry");
            }
            self.emitter
                .emit(EventName::SyncOffline, json!({ "account_id": account_id }));
        } else {
            warn!(account = %account_id, error = %error, "sync failed");
            self.emitter.emit(
                EventName::SyncError,
                json!({
                    "account_id": account_id,
                    "code": error_code(error.code()),
                    "message_key": error.message_key(),
                    "detail": error.detail(),
                }),
            );
        }
    }

    fn finish_run(&self, account_id: &str, run: u64) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.get(account_id).is_some_and(|entry| entry.run == run) {
            running.remove(account_id);
        }
    }
}

fn bind<F, Fut>(
    service: &Arc<CalendarService>,
    handler: F,
) -> impl Fn(Vec<Value>) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<CalendarService>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let service = service.clone();
    move |args| handler(service.clone(), args)
}

fn reply<T: Serialize>(value: T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| ErrorResponse::internal(e.to_string()))
}

fn redacted(mut account: Account) -> Account {
    account.credentials = None;
    account
}

/// Raw records leave the worker without account credentials.
fn strip_credentials(mut record: Value) -> Value {
    if let Some(fields) = record.as_object_mut() {
        fields.remove("credentials");
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use calbridge_core::{Credentials, EventTime, ProviderKind};
    use calbridge_protocol::{ErrorCode, Frame};
    use calbridge_providers::{CapabilitySet, NetworkState, SyncStream};
    use calbridge_store::{Database, Settings};
    use chrono::Utc;
    use tokio::sync::{Notify, mpsc};

    struct FakeProvider {
        network: ConnectivityMonitor,
        runs: Arc<AtomicUsize>,
        hold: Option<Arc<Notify>>,
    }

    impl CalendarProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Caldav
        }

        fn capabilities(&self) -> BoxFuture<'_, ProviderResult<CapabilitySet>> {
            Box::pin(async { Ok(CapabilitySet::read_write_remote()) })
        }

        fn find_calendars<'a>(
            &'a self,
            account: &'a Account,
        ) -> BoxFuture<'a, ProviderResult<Vec<Calendar>>> {
            Box::pin(async move { Ok(vec![Calendar::new("work-cal", &account.id, "Work")]) })
        }

        fn sync(self: Arc<Self>, _account: Account) -> SyncStream {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let online = self.network.state().online;
            let hold = self.hold.clone();
            SyncStream::spawn(move |tx| async move {
                if !online {
                    return Err(ProviderError::offline("no route to host"));
                }
                tx.send(SyncEvent::Started).await;
                if let Some(hold) = hold {
                    hold.notified().await;
                }
                tx.send(SyncEvent::ItemSynced(1)).await;
                tx.send(SyncEvent::Completed(Some("token-1".to_string())))
                    .await;
                Ok(())
            })
        }

        fn create_event(&self, event: Event) -> BoxFuture<'_, ProviderResult<Event>> {
            Box::pin(async move { Ok(event) })
        }

        fn update_event(&self, event: Event) -> BoxFuture<'_, ProviderResult<Event>> {
            Box::pin(async move { Ok(event) })
        }

        fn delete_event<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Harness {
        service: Arc<CalendarService>,
        network: ConnectivityMonitor,
        runs: Arc<AtomicUsize>,
        broadcasts: mpsc::UnboundedReceiver<Frame>,
    }

    impl Harness {
        async fn next(&mut self) -> (EventName, Value) {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.broadcasts.recv())
                .await
                .expect("broadcast timed out")
                .expect("emitter closed");
            match frame {
                Frame::Broadcast(broadcast) => (broadcast.event, broadcast.payload),
                other => panic!("unexpected frame {:?}", other),
            }
        }

        async fn events_until_complete(&mut self) -> Vec<EventName> {
            let mut events = Vec::new();
            loop {
                let (event, _) = self.next().await;
                events.push(event);
                if event == EventName::SyncComplete {
                    return events;
                }
            }
        }
    }

    fn work_account() -> Account {
        Account::caldav("work", "https://dav.example.com/")
            .with_credentials(Credentials::new("alice", "secret"))
    }

    async fn harness(
        factory: Arc<StoreFactory>,
        network: NetworkState,
        hold: Option<Arc<Notify>>,
    ) -> Harness {
        let network = ConnectivityMonitor::new(network);
        let emitter = Emitter::new();
        let (tx, broadcasts) = mpsc::unbounded_channel();
        emitter.attach(tx);
        let runs = Arc::new(AtomicUsize::new(0));
        let (fake_network, fake_runs) = (network.clone(), runs.clone());
        let service = CalendarService::builder(factory, emitter)
            .connectivity(Arc::new(network.clone()))
            .provider_builder(move |_account, _factory, _config, _connectivity| {
                let provider: Arc<dyn CalendarProvider> = Arc::new(FakeProvider {
                    network: fake_network.clone(),
                    runs: fake_runs.clone(),
                    hold: hold.clone(),
                });
                async move { Ok(provider) }
            })
            .start()
            .await
            .unwrap();
        Harness {
            service,
            network,
            runs,
            broadcasts,
        }
    }

    fn online() -> NetworkState {
        NetworkState {
            online: true,
            metered: false,
        }
    }

    fn offline() -> NetworkState {
        NetworkState {
            online: false,
            metered: false,
        }
    }

    fn factory() -> Arc<StoreFactory> {
        Arc::new(StoreFactory::new(Database::open("test")))
    }

    #[tokio::test]
    async fn sync_broadcasts_lifecycle_and_stores_token() {
        let mut h = harness(factory(), online(), None).await;
        h.service.put_account(work_account()).await.unwrap();

        assert!(h.service.start_sync("work").await.unwrap());
        let (event, payload) = h.next().await;
        assert_eq!(event, EventName::SyncStart);
        assert_eq!(payload, json!({ "account_id": "work" }));
        let (event, payload) = h.next().await;
        assert_eq!(event, EventName::SyncProgress);
        assert_eq!(payload["synced"], 1);
        let (event, _) = h.next().await;
        assert_eq!(event, EventName::SyncComplete);

        let account = h.service.account("work").await.unwrap();
        assert_eq!(account.sync_token.as_deref(), Some("token-1"));
        assert!(h.service.syncing().is_empty());
    }

    #[tokio::test]
    async fn offline_sync_is_retried_once_on_reconnection() {
        let mut h = harness(factory(), offline(), None).await;
        h.service.put_account(work_account()).await.unwrap();

        assert!(h.service.start_sync("work").await.unwrap());
        assert_eq!(
            h.events_until_complete().await,
            vec![EventName::SyncStart, EventName::SyncOffline, EventName::SyncComplete]
        );
        assert_eq!(h.service.retry.accounts().await, vec!["work"]);

        h.network.set_online(true);
        assert_eq!(
            h.events_until_complete().await,
            vec![EventName::SyncStart, EventName::SyncProgress, EventName::SyncComplete]
        );
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
        assert!(h.service.retry.accounts().await.is_empty());
    }

    #[tokio::test]
    async fn queued_retries_run_at_start_when_online() {
        let factory = factory();
        factory
            .store::<Account>()
            .await
            .unwrap()
            .persist(&work_account())
            .await
            .unwrap();
        StoreSettings::new(factory.store::<Setting>().await.unwrap())
            .set_setting(keys::OFFLINE_RETRY, json!(["work"]))
            .await
            .unwrap();

        let mut h = harness(factory.clone(), online(), None).await;
        assert_eq!(
            h.events_until_complete().await,
            vec![EventName::SyncStart, EventName::SyncProgress, EventName::SyncComplete]
        );
        let stored = StoreSettings::new(factory.store::<Setting>().await.unwrap())
            .get_setting(keys::OFFLINE_RETRY)
            .await
            .unwrap();
        assert_eq!(stored, Some(json!([])));
    }

    #[tokio::test]
    async fn cancelled_sync_still_completes() {
        let hold = Arc::new(Notify::new());
        let mut h = harness(factory(), online(), Some(hold)).await;
        h.service.put_account(work_account()).await.unwrap();

        assert!(h.service.start_sync("work").await.unwrap());
        assert!(!h.service.start_sync("work").await.unwrap());
        assert_eq!(h.next().await.0, EventName::SyncStart);

        assert!(h.service.cancel_sync("work"));
        assert_eq!(h.next().await.0, EventName::SyncComplete);
        assert!(!h.service.cancel_sync("work"));
        assert!(h.service.syncing().is_empty());
    }

    #[tokio::test]
    async fn metered_network_respects_setting() {
        let factory = factory();
        let network = NetworkState {
            online: true,
            metered: true,
        };
        let mut h = harness(factory.clone(), network, None).await;
        h.service.put_account(work_account()).await.unwrap();
        let settings = StoreSettings::new(factory.store::<Setting>().await.unwrap());

        settings
            .set_setting(keys::SYNC_ON_METERED, json!(false))
            .await
            .unwrap();
        assert!(!h.service.start_sync("work").await.unwrap());
        assert!(h.broadcasts.try_recv().is_err());
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);

        settings
            .set_setting(keys::SYNC_ON_METERED, json!(true))
            .await
            .unwrap();
        assert!(h.service.start_sync("work").await.unwrap());
        assert_eq!(h.events_until_complete().await.len(), 3);
    }

    #[tokio::test]
    async fn handler_table_reports_missing_accounts() {
        let h = harness(factory(), online(), None).await;
        let err = h
            .service
            .service()
            .call("sync", vec![json!("nope")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err = h
            .service
            .service()
            .call("get", vec![json!("Bogus"), json!("x")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn accounts_are_listed_without_credentials() {
        let h = harness(factory(), online(), None).await;
        let table = h.service.service();
        table
            .call("putAccount", vec![serde_json::to_value(work_account()).unwrap()])
            .await
            .unwrap();
        let listed = table.call("listAccounts", vec![]).await.unwrap();
        assert_eq!(listed[0]["id"], "work");
        assert!(listed[0].get("credentials").is_none());

        let raw = table.call("get", vec![json!("Account"), json!("work")]).await.unwrap();
        assert_eq!(raw["url"], "https://dav.example.com/");
        assert!(raw.get("credentials").is_none());
        let all = table.call("list", vec![json!("Account")]).await.unwrap();
        assert!(all[0].get("credentials").is_none());

        let calendars = table.call("findCalendars", vec![json!("work")]).await.unwrap();
        assert_eq!(calendars[0]["name"], "Work");
    }

    #[tokio::test]
    async fn local_event_round_trip() {
        let factory = factory();
        let service = CalendarService::builder(factory.clone(), Emitter::new())
            .start()
            .await
            .unwrap();
        let table = service.service();
        table
            .call("putAccount", vec![serde_json::to_value(Account::local("device")).unwrap()])
            .await
            .unwrap();

        let start = Utc::now() + chrono::Duration::hours(1);
        let event = Event::new(
            "evt-1",
            "",
            "Standup",
            EventTime::from_utc(start),
            EventTime::from_utc(start + chrono::Duration::minutes(15)),
        );
        table
            .call("createEvent", vec![json!("device"), serde_json::to_value(&event).unwrap()])
            .await
            .unwrap();

        let stored = table
            .call("get", vec![json!("Event"), json!("evt-1")])
            .await
            .unwrap();
        assert_eq!(stored["title"], "Standup");
        assert_eq!(table.call("expand", vec![]).await.unwrap(), json!(1));

        assert_eq!(table.call("removeAccount", vec![json!("device")]).await.unwrap(), json!(true));
        assert_eq!(
            table.call("listAccounts", vec![]).await.unwrap(),
            json!([])
        );
    }
}
