//! Client facade
//!
//! [`IntemptClient`] ties together the credentials, visitor identity, event
//! queue, delivery worker and region monitor of one tracker. Most apps use
//! the process-wide instance from [`shared_client`]; independent instances
//! come from [`IntemptClient::builder`].

use crate::config::Config;
use crate::context::ClientContext;
use crate::delivery::{DeliveryDispatcher, DispatcherHandle, HttpTransport, Transport};
use crate::error::{Error, Result};
use crate::identity::VisitorIdentityStore;
use crate::queue::{CompletionHandler, EventQueue, PropertyOverrides, QueueStatsSnapshot};
use crate::region::{LocationProvider, NoopLocationProvider, RegionMonitor, RegionObserver};
use crate::store::{queue_snapshot_key, KeyValueStore, MemoryStore, SqliteStore};
use crate::types::{
    AuthorizationLevel, AuthorizationStatus, BeaconRegion, Event, Location, Properties, Proximity,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};
use tokio::runtime::{Handle, Runtime};
use uuid::Uuid;

/// Version of this SDK
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Collection that receives `identify` calls
pub const IDENTIFY_COLLECTION: &str = "identify";

/// Builder for [`IntemptClient`]
pub struct ClientBuilder {
    org_id: String,
    tracker_id: String,
    token: String,
    config: Option<Config>,
    storage: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn Transport>>,
    location_provider: Option<Arc<dyn LocationProvider>>,
    runtime: Option<Handle>,
    overrides: PropertyOverrides,
}

impl ClientBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Durable storage. Defaults to the SQLite store under the data dir.
    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Delivery transport. Defaults to HTTP against `delivery.endpoint`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn location_provider(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.location_provider = Some(provider);
        self
    }

    /// Run background work on an existing tokio runtime instead of a
    /// dedicated one
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Properties merged into every keyed event. Keys passed with the
    /// event itself take precedence.
    pub fn properties_overrides<K, I>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.overrides.fixed = properties
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        self
    }

    /// Properties computed per collection when an event is queued. They win
    /// over [`properties_overrides`](Self::properties_overrides) and lose to
    /// the event's own keys.
    pub fn properties_overrides_fn<F>(mut self, overrides: F) -> Self
    where
        F: Fn(&str) -> Vec<(String, Value)> + Send + Sync + 'static,
    {
        self.overrides.dynamic = Some(Arc::new(overrides));
        self
    }

    pub fn build(self) -> Result<IntemptClient> {
        let context = Arc::new(ClientContext::new(
            self.org_id,
            self.tracker_id,
            self.token,
        )?);
        let config = self.config.unwrap_or_default();
        config.delivery.validate()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => default_storage(),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.delivery)?),
        };
        let provider = self
            .location_provider
            .unwrap_or_else(|| Arc::new(NoopLocationProvider));

        let (runtime, handle) = match self.runtime {
            Some(handle) => (None, handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("intempt-delivery")
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let identity = Arc::new(VisitorIdentityStore::new(storage.clone()));
        let queue = Arc::new(
            EventQueue::new(identity.clone(), config.delivery.queue_capacity)
                .with_overrides(self.overrides),
        );

        let snapshot_key = queue_snapshot_key(context.tracker_id());
        if config.delivery.persist_queue {
            restore_queue(storage.as_ref(), &snapshot_key, &queue);
        }

        let monitor = RegionMonitor::new(
            config.regions.clone(),
            provider,
            Some(queue.clone()),
            Some(handle.clone()),
        );
        let dispatcher = DeliveryDispatcher::spawn(
            context.clone(),
            queue.clone(),
            transport,
            &config.delivery,
            &handle,
        );

        tracing::info!(
            org_id = %context.org_id(),
            tracker_id = %context.tracker_id(),
            sdk_version = SDK_VERSION,
            "Intempt client started"
        );

        Ok(IntemptClient {
            context,
            identity,
            queue,
            monitor,
            storage,
            snapshot_key,
            persist_queue: config.delivery.persist_queue,
            dispatcher,
            runtime,
        })
    }
}

fn default_storage() -> Arc<dyn KeyValueStore> {
    let path = Config::store_path();
    match SqliteStore::open(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not open store, visitor id will not survive restarts"
            );
            Arc::new(MemoryStore::new())
        }
    }
}

fn restore_queue(storage: &dyn KeyValueStore, key: &str, queue: &EventQueue) {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read queue snapshot");
            return;
        }
    };
    match serde_json::from_str::<Vec<Event>>(&raw) {
        Ok(events) => queue.restore(events),
        Err(e) => tracing::warn!(error = %e, "Discarding unreadable queue snapshot"),
    }
    if let Err(e) = storage.delete(key) {
        tracing::warn!(error = %e, "Could not clear queue snapshot");
    }
}

/// Entry point for capturing events
pub struct IntemptClient {
    context: Arc<ClientContext>,
    identity: Arc<VisitorIdentityStore>,
    queue: Arc<EventQueue>,
    monitor: RegionMonitor,
    storage: Arc<dyn KeyValueStore>,
    snapshot_key: String,
    persist_queue: bool,
    dispatcher: DispatcherHandle,
    /// Present when the client owns its runtime
    runtime: Option<Runtime>,
}

impl IntemptClient {
    /// Client with default configuration and collaborators
    pub fn new(
        org_id: impl Into<String>,
        tracker_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        Self::builder(org_id, tracker_id, token).build()
    }

    pub fn builder(
        org_id: impl Into<String>,
        tracker_id: impl Into<String>,
        token: impl Into<String>,
    ) -> ClientBuilder {
        ClientBuilder {
            org_id: org_id.into(),
            tracker_id: tracker_id.into(),
            token: token.into(),
            config: None,
            storage: None,
            transport: None,
            location_provider: None,
            runtime: None,
            overrides: PropertyOverrides::default(),
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    // ============================================
    // Events
    // ============================================

    /// Queue keyed properties for `collection_name`.
    ///
    /// Returns once the event is validated and queued; delivery happens in
    /// the background.
    pub fn add_event(&self, properties: Properties, collection_name: &str) -> Result<()> {
        self.queue.add_event(properties, collection_name)
    }

    /// Like [`add_event`](Self::add_event), reporting the delivery outcome
    /// to `completion` exactly once
    pub fn add_event_with_completion<F>(
        &self,
        properties: Properties,
        collection_name: &str,
        completion: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.queue
            .add_event_with_completion(properties, collection_name, Some(Box::new(completion)))
    }

    /// Queue positional values lining up with the collection's schema
    pub fn track(&self, collection_name: &str, values: Vec<Value>) -> Result<()> {
        self.queue.track(collection_name, values)
    }

    pub fn track_with_completion<F>(
        &self,
        collection_name: &str,
        values: Vec<Value>,
        completion: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.queue
            .track_with_completion(collection_name, values, Some(Box::new(completion)))
    }

    // ============================================
    // Identity
    // ============================================

    /// Durable visitor id, generated on first use
    pub fn visitor_id(&self) -> String {
        let lookup = self.identity.visitor_id();
        if let Some(e) = lookup.error {
            tracing::warn!(error = %e, "Using in-memory visitor id");
        }
        lookup.visitor_id.to_string()
    }

    /// Visitor id, failing when it could not be persisted
    pub fn try_visitor_id(&self) -> Result<Uuid> {
        self.identity.try_visitor_id()
    }

    /// Attach an external identity to this visitor and merge `properties`
    /// into the stored profile (per-key overwrite).
    ///
    /// Also queues an `identify` event so the backend sees the change.
    pub fn identify<K, I>(&self, identity: &str, properties: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.identify_inner(identity, properties, None)
    }

    pub fn identify_with_completion<K, I, F>(
        &self,
        identity: &str,
        properties: I,
        completion: F,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.identify_inner(identity, properties, Some(Box::new(completion)))
    }

    fn identify_inner<K, I>(
        &self,
        identity: &str,
        properties: I,
        completion: Option<CompletionHandler>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let properties: Vec<(String, Value)> = properties
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();

        let stored = self.identity.identify(identity, properties.clone());
        if matches!(stored, Err(Error::Validation(_))) {
            return stored.map(|_| ());
        }

        let mut pairs = Vec::with_capacity(properties.len() + 1);
        pairs.push(("identity".to_string(), Value::from(identity)));
        pairs.extend(properties);
        self.queue.add_event_with_completion(
            Properties::Keyed(pairs),
            IDENTIFY_COLLECTION,
            completion,
        )?;

        stored.map(|visitor_id| {
            tracing::debug!(visitor_id = %visitor_id, identity, "Visitor identified");
        })
    }

    pub fn external_identity(&self) -> Option<String> {
        self.identity.external_identity()
    }

    // ============================================
    // Geo-location and beacons
    // ============================================

    pub fn enable_geo_location(&self) {
        self.context.set_geo_location_enabled(true);
        self.monitor.enable();
    }

    /// Stop region monitoring. No region notification is delivered after
    /// this returns.
    pub fn disable_geo_location(&self) {
        self.context.set_geo_location_enabled(false);
        self.monitor.disable();
    }

    pub fn is_geo_location_enabled(&self) -> bool {
        self.context.is_geo_location_enabled()
    }

    /// Ask the platform for `level`. Each level is forwarded at most once
    /// and never after a higher one.
    pub fn authorize_geo_location(&self, level: AuthorizationLevel) -> Result<()> {
        if !self.context.request_authorization(level) {
            tracing::debug!(?level, "Authorization already requested");
            return Ok(());
        }
        self.monitor.request_authorization(level)
    }

    /// Request a fresh location fix. Does nothing while geo-location is
    /// disabled.
    pub fn refresh_current_location(&self) -> Result<()> {
        if !self.context.is_geo_location_enabled() {
            tracing::debug!("Geo location disabled, location refresh skipped");
            return Ok(());
        }
        self.monitor.refresh_current_location()
    }

    pub fn current_location(&self) -> Option<Location> {
        self.monitor.current_location()
    }

    /// Start monitoring a beacon region
    pub fn monitor_region(&self, region: BeaconRegion) -> Result<()> {
        self.monitor.monitor_region(region)
    }

    pub fn stop_monitoring_region(&self, region: &BeaconRegion) {
        self.monitor.stop_monitoring_region(region);
    }

    pub fn set_region_observer(&self, observer: Weak<dyn RegionObserver>) {
        self.monitor.set_observer(observer);
    }

    /// Platform callback: proximity reading for a beacon
    pub fn on_proximity_sample(&self, beacon: BeaconRegion, proximity: Proximity) {
        self.monitor.on_proximity_sample(beacon, proximity);
    }

    /// Platform callback: authorization grant changed
    pub fn on_authorization_changed(&self, status: AuthorizationStatus) {
        self.monitor.on_authorization_changed(status);
    }

    /// Platform callback: new location fix
    pub fn on_location_update(&self, location: Location) {
        self.monitor.on_location_update(location);
    }

    pub fn region_monitor(&self) -> &RegionMonitor {
        &self.monitor
    }

    // ============================================
    // Introspection
    // ============================================

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStatsSnapshot {
        self.queue.stats().snapshot()
    }

    pub fn sdk_version(&self) -> &'static str {
        SDK_VERSION
    }

    fn persist_queue_snapshot(&self) {
        let events = self.queue.snapshot();
        let outcome = if events.is_empty() {
            self.storage.delete(&self.snapshot_key)
        } else {
            serde_json::to_string(&events)
                .map_err(Error::from)
                .and_then(|json| self.storage.put(&self.snapshot_key, &json))
        };
        match outcome {
            Ok(()) if !events.is_empty() => {
                tracing::info!(count = events.len(), "Persisted unsent events");
            }
            Ok(()) => {}
            Err(e) => tracing::warn!(error = %e, "Could not persist unsent events"),
        }
    }
}

impl Drop for IntemptClient {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
        self.monitor.disable();
        if self.persist_queue {
            self.persist_queue_snapshot();
        }
        // Whatever is still queued fails now; a batch on the wire resolves
        // when its send ends or, on an owned runtime, when the task is dropped
        let discarded = self.queue.close();
        if discarded > 0 && !self.persist_queue {
            tracing::warn!(discarded, "Discarded unsent events");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        tracing::info!(tracker_id = %self.context.tracker_id(), "Intempt client stopped");
    }
}

// ============================================
// Shared instance
// ============================================

fn shared_slot() -> &'static RwLock<Option<Arc<IntemptClient>>> {
    static SHARED: OnceLock<RwLock<Option<Arc<IntemptClient>>>> = OnceLock::new();
    SHARED.get_or_init(|| RwLock::new(None))
}

/// The process-wide client.
///
/// Built on first use from the `[client]` section of the config file.
pub fn shared_client() -> Result<Arc<IntemptClient>> {
    if let Some(client) = shared_slot().read().as_ref() {
        return Ok(client.clone());
    }

    let mut slot = shared_slot().write();
    if let Some(client) = slot.as_ref() {
        return Ok(client.clone());
    }

    let config = Config::load()?;
    let (org_id, tracker_id, token) = config.client.credentials().ok_or_else(|| {
        Error::Config(format!(
            "no client credentials in {}",
            Config::config_path().display()
        ))
    })?;
    let client = Arc::new(
        IntemptClient::builder(org_id, tracker_id, token)
            .config(config.clone())
            .build()?,
    );
    *slot = Some(client.clone());
    Ok(client)
}

/// Configure (or replace) the process-wide client with explicit credentials
pub fn shared_client_with(
    org_id: impl Into<String>,
    tracker_id: impl Into<String>,
    token: impl Into<String>,
) -> Result<Arc<IntemptClient>> {
    let config = Config::load()?;
    let client = Arc::new(
        IntemptClient::builder(org_id, tracker_id, token)
            .config(config)
            .build()?,
    );
    let previous = shared_slot().write().replace(client.clone());
    if previous.is_some() {
        tracing::info!("Replaced shared client");
    }
    Ok(client)
}
