// ── Hub facade ──
//
// Lifecycle of one hub session at a time: snapshot loads, the dispatch
// loop feeding caches and subscribers, registry reload throttling and
// command routing. The fan-out broker and the background task tracker
// belong to the `Hub` and outlive sessions, so user subscriptions survive
// a reconnect. The caches belong to the session and are thrown away with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use futures_util::StreamExt;
use homesync_api::{EventStream, HubConnection, RawEvent, RegistryKind, ServiceCall};
use parking_lot::ReentrantMutex;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandEnvelope, CommandResult, command_processor_task};
use crate::config::HubConfig;
use crate::entity::Entity;
use crate::error::CoreError;
use crate::model::{
    Area, Device, EntityId, EntityRegistration, EntityState, Event, Floor, Label, StateChange,
};
use crate::store::{EntityStateCache, RegistryCache, RegistrySnapshot};
use crate::stream::{EventBroker, EventScope, Feed, FeedContext, Subscription};
use crate::tasks::{TaskTracker, Throttle};

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

// ── Session ──────────────────────────────────────────────────────

/// Everything tied to one live connection.
struct Session {
    id: u64,
    states: Arc<EntityStateCache>,
    registries: Arc<RegistryCache>,
    cancel: CancellationToken,
    command_tx: mpsc::Sender<CommandEnvelope>,
    task_handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    registry_watch: parking_lot::Mutex<Vec<Subscription>>,
}

impl Session {
    /// Stop reacting to registry changes and discard both caches.
    fn close(&self) {
        self.cancel.cancel();
        self.registry_watch.lock().clear();
        self.states.invalidate();
        self.registries.invalidate();
    }
}

// ── Hub ──────────────────────────────────────────────────────────

/// The main entry point for automation code.
///
/// Cheaply cloneable via `Arc<HubInner>`. Does nothing until
/// [`connect()`](Self::connect) is handed a live connection.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    broker: EventBroker,
    feeds: FeedContext,
    tracker: TaskTracker,
    session: ArcSwapOption<Session>,
    next_session: AtomicU64,
    connection_state: watch::Sender<ConnectionState>,
    /// Token of the session being set up or running; cancelled first on
    /// disconnect so a slow connect gives up promptly.
    session_cancel: parking_lot::Mutex<CancellationToken>,
    /// Serializes connect and disconnect.
    lifecycle: Mutex<()>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let gate = Arc::new(ReentrantMutex::new(()));
        let broker = EventBroker::new(Arc::clone(&gate));
        let tracker = TaskTracker::new();
        let feeds = FeedContext {
            gate,
            tracker: tracker.clone(),
            capacity: config.stream_capacity,
        };
        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(HubInner {
                config,
                broker,
                feeds,
                tracker,
                session: ArcSwapOption::empty(),
                next_session: AtomicU64::new(1),
                connection_state,
                session_cancel: parking_lot::Mutex::new(CancellationToken::new()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Tracker holding every fire-and-forget task spawned through this hub.
    pub fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connection_state.borrow() == ConnectionState::Connected
    }

    /// Updates the value even while nobody is watching.
    fn set_connection_state(&self, state: ConnectionState) {
        self.inner.connection_state.send_replace(state);
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Start a session over `connection`.
    ///
    /// Subscribes to the event stream first, then loads the state snapshot
    /// and all five registries. Events that arrive meanwhile stay buffered
    /// in the stream and are replayed on top of the snapshot once dispatch
    /// starts; overwriting is idempotent, so overlap is harmless. Any
    /// previous session is torn down first.
    pub async fn connect(&self, connection: Arc<dyn HubConnection>) -> Result<(), CoreError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.teardown().await;

        let cancel = CancellationToken::new();
        *self.inner.session_cancel.lock() = cancel.clone();
        self.set_connection_state(ConnectionState::Connecting);

        match self.open_session(connection, &cancel).await {
            Ok(session) => {
                let id = session.id;
                let entities = session.states.len();
                self.set_connection_state(ConnectionState::Connected);
                info!(session = id, entities, "hub session established");
                Ok(())
            }
            Err(e) => {
                cancel.cancel();
                self.set_connection_state(ConnectionState::Failed);
                error!(error = %e, "hub session setup failed");
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        connection: Arc<dyn HubConnection>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>, CoreError> {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let states = Arc::new(EntityStateCache::new());
        let registries = Arc::new(RegistryCache::new());

        let load = async {
            let events = connection.subscribe_events().await?;
            let snapshot = connection.fetch_states().await?;
            states.load_snapshot(snapshot);
            registries.load_all(connection.as_ref()).await?;
            Ok::<_, CoreError>(events)
        };
        let timeout = self.inner.config.initialize_timeout;
        let events = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CoreError::Cancelled),
            result = tokio::time::timeout(timeout, load) => result.map_err(|_| CoreError::Timeout {
                timeout_secs: timeout.as_secs(),
            })??,
        };

        let registry_watch: Vec<Subscription> = RegistryKind::ALL
            .into_iter()
            .map(|kind| self.watch_registry(kind, &connection, &registries, cancel))
            .collect();

        let (command_tx, command_rx) = mpsc::channel(self.inner.config.command_channel_size.max(1));
        let session = Arc::new(Session {
            id,
            states: Arc::clone(&states),
            registries,
            cancel: cancel.clone(),
            command_tx,
            task_handles: parking_lot::Mutex::new(Vec::new()),
            registry_watch: parking_lot::Mutex::new(registry_watch),
        });
        // Published before dispatch starts so handlers can read the caches.
        self.inner.session.store(Some(Arc::clone(&session)));

        session.task_handles.lock().extend([
            tokio::spawn(dispatch_task(
                self.clone(),
                id,
                states,
                events,
                cancel.clone(),
            )),
            tokio::spawn(command_processor_task(
                connection,
                cancel.clone(),
                command_rx,
            )),
        ]);
        Ok(session)
    }

    /// Reload the `kind` registry whenever the hub reports a change,
    /// throttled so a burst of notifications costs at most two reloads per
    /// interval. Reloads run as tracked background work.
    fn watch_registry(
        &self,
        kind: RegistryKind,
        connection: &Arc<dyn HubConnection>,
        registries: &Arc<RegistryCache>,
        cancel: &CancellationToken,
    ) -> Subscription {
        let tracker = self.inner.tracker.clone();
        let connection = Arc::clone(connection);
        let registries = Arc::clone(registries);
        let reload_cancel = cancel.clone();

        let throttle = Throttle::new(
            self.inner.config.registry_throttle,
            cancel.clone(),
            move |()| {
                debug!(registry = %kind, "registry changed, reloading");
                let connection = Arc::clone(&connection);
                let registries = Arc::clone(&registries);
                let cancel = reload_cancel.clone();
                tracker.track(format!("reload {kind} registry"), async move {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => Err(CoreError::Cancelled),
                        result = registries.reload(kind, connection.as_ref()) => result,
                    }
                });
            },
        );

        self.events()
            .registry_updates(kind)
            .subscribe(move |_| {
                throttle.push(());
                Ok(())
            })
    }

    /// End the current session, if any.
    ///
    /// Cancels its background work, waits for its tasks and discards both
    /// caches. User subscriptions stay registered for the next session.
    pub async fn disconnect(&self) {
        self.inner.session_cancel.lock().cancel();
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.teardown().await;
        self.set_connection_state(ConnectionState::Disconnected);
        debug!("disconnected");
    }

    /// Disconnect, then wait up to the configured timeout for tracked
    /// background work. Returns how many tasks were abandoned.
    pub async fn shutdown(&self) -> usize {
        self.disconnect().await;
        let abandoned = self
            .inner
            .tracker
            .shutdown(self.inner.config.shutdown_timeout)
            .await;
        info!(abandoned, "hub shut down");
        abandoned
    }

    async fn teardown(&self) {
        let Some(session) = self.inner.session.swap(None) else {
            return;
        };
        session.cancel.cancel();
        let handles = std::mem::take(&mut *session.task_handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        session.close();
        debug!(session = session.id, "session torn down");
    }

    /// The event stream of session `id` ended on its own.
    fn session_lost(&self, id: u64) {
        let previous = self
            .inner
            .session
            .rcu(|current| current.as_ref().filter(|s| s.id != id).cloned());
        if let Some(session) = previous.filter(|s| s.id == id) {
            session.close();
            self.set_connection_state(ConnectionState::Disconnected);
            warn!(session = id, "hub event stream ended, session closed");
        }
    }

    /// Apply one event to the state cache, then hand it to subscribers.
    ///
    /// Both steps run under the dispatch gate, so a subscriber reading
    /// state from its handler sees the post-update value and a
    /// "with current" subscription can't observe the update twice.
    fn dispatch(&self, states: &EntityStateCache, raw: RawEvent) {
        let event = Arc::new(Event::from(raw));
        let _gate = self.inner.broker.gate().lock();
        states.apply(&event);
        self.inner.broker.publish(&event);
    }

    // ── Reads ────────────────────────────────────────────────────

    fn session(&self) -> Option<Arc<Session>> {
        self.inner.session.load_full()
    }

    fn states(&self) -> Result<Arc<EntityStateCache>, CoreError> {
        self.session()
            .map(|session| Arc::clone(&session.states))
            .ok_or(CoreError::NotInitialized {
                cache: "entity state",
            })
    }

    /// Current state of `entity_id`; `Ok(None)` for an unknown entity.
    pub fn get_state(&self, entity_id: &str) -> Result<Option<Arc<EntityState>>, CoreError> {
        self.states()?.get_state(entity_id)
    }

    pub fn all_entity_ids(&self) -> Result<Vec<EntityId>, CoreError> {
        self.states()?.all_entity_ids()
    }

    /// Handle for one entity. Never fails: the entity need not exist yet.
    pub fn entity(&self, entity_id: impl Into<EntityId>) -> Entity {
        Entity::new(self.clone(), entity_id.into(), self.events())
    }

    pub fn all_entities(&self) -> Result<Vec<Entity>, CoreError> {
        Ok(self
            .all_entity_ids()?
            .into_iter()
            .map(|id| self.entity(id))
            .collect())
    }

    /// Current consistent view of every registry.
    pub fn registry(&self) -> Result<Arc<RegistrySnapshot>, CoreError> {
        self.session()
            .ok_or(CoreError::NotInitialized { cache: "registry" })?
            .registries
            .snapshot()
    }

    pub fn get_entity_registration(
        &self,
        entity_id: &str,
    ) -> Result<Option<Arc<EntityRegistration>>, CoreError> {
        Ok(self.registry()?.entity_registration(entity_id))
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<Arc<Device>>, CoreError> {
        Ok(self.registry()?.device(device_id))
    }

    pub fn get_area(&self, area_id: &str) -> Result<Option<Arc<Area>>, CoreError> {
        Ok(self.registry()?.area(area_id))
    }

    pub fn get_floor(&self, floor_id: &str) -> Result<Option<Arc<Floor>>, CoreError> {
        Ok(self.registry()?.floor(floor_id))
    }

    pub fn get_label(&self, label_id: &str) -> Result<Option<Arc<Label>>, CoreError> {
        Ok(self.registry()?.label(label_id))
    }

    pub fn entities_for_area(&self, area_id: &str) -> Result<Vec<EntityId>, CoreError> {
        Ok(self.registry()?.entities_for_area(area_id))
    }

    pub fn entities_for_device(&self, device_id: &str) -> Result<Vec<EntityId>, CoreError> {
        Ok(self.registry()?.entities_for_device(device_id))
    }

    pub fn entities_for_label(&self, label_id: &str) -> Result<Vec<EntityId>, CoreError> {
        Ok(self.registry()?.entities_for_label(label_id))
    }

    pub fn devices_for_area(&self, area_id: &str) -> Result<Vec<Arc<Device>>, CoreError> {
        Ok(self.registry()?.devices_for_area(area_id))
    }

    pub fn areas_for_floor(&self, floor_id: &str) -> Result<Vec<Arc<Area>>, CoreError> {
        Ok(self.registry()?.areas_for_floor(floor_id))
    }

    pub fn area_for_entity(&self, entity_id: &str) -> Result<Option<Arc<Area>>, CoreError> {
        Ok(self.registry()?.area_for_entity(entity_id))
    }

    pub fn labels_for_entity(&self, entity_id: &str) -> Result<Vec<Arc<Label>>, CoreError> {
        Ok(self.registry()?.labels_for_entity(entity_id))
    }

    pub fn entity_registrations(&self) -> Result<Vec<Arc<EntityRegistration>>, CoreError> {
        Ok(self.registry()?.entity_registrations())
    }

    pub fn devices(&self) -> Result<Vec<Arc<Device>>, CoreError> {
        Ok(self.registry()?.devices())
    }

    pub fn areas(&self) -> Result<Vec<Arc<Area>>, CoreError> {
        Ok(self.registry()?.areas())
    }

    pub fn floors(&self) -> Result<Vec<Arc<Floor>>, CoreError> {
        Ok(self.registry()?.floors())
    }

    pub fn labels(&self) -> Result<Vec<Arc<Label>>, CoreError> {
        Ok(self.registry()?.labels())
    }

    // ── Streams ──────────────────────────────────────────────────

    /// Every event the hub fires.
    pub fn events(&self) -> Feed<Arc<Event>> {
        Feed::from_broker(&self.inner.broker, self.inner.feeds.clone())
    }

    pub fn events_of_type(&self, event_type: impl Into<String>) -> Feed<Arc<Event>> {
        self.events().of_type(event_type)
    }

    pub fn state_all_changes(&self) -> Feed<Arc<StateChange>> {
        self.events().state_all_changes()
    }

    pub fn state_changes(&self) -> Feed<Arc<StateChange>> {
        self.events().state_changes()
    }

    /// Child fan-out whose subscriptions all end when it is closed.
    pub fn scope(&self) -> EventScope {
        EventScope::new(self.clone())
    }

    pub(crate) fn broker(&self) -> &EventBroker {
        &self.inner.broker
    }

    pub(crate) fn feed_context(&self) -> FeedContext {
        self.inner.feeds.clone()
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Execute a command through the session's command processor.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, CoreError> {
        let session = self.session().ok_or(CoreError::Disconnected)?;

        let (tx, rx) = oneshot::channel();
        session
            .command_tx
            .send(CommandEnvelope {
                command,
                response_tx: tx,
            })
            .await
            .map_err(|_| CoreError::Disconnected)?;

        rx.await.map_err(|_| CoreError::Disconnected)?
    }

    /// Call a service without waiting. Failures are logged by the tracker.
    pub fn call_service(&self, call: ServiceCall) {
        let hub = self.clone();
        let description = format!("call service {}.{}", call.domain, call.service);
        self.inner.tracker.track(description, async move {
            hub.execute(Command::CallService(call)).await.map(|_| ())
        });
    }

    /// Call a service and wait for its response payload.
    pub async fn call_service_with_response(
        &self,
        mut call: ServiceCall,
    ) -> Result<Option<Value>, CoreError> {
        call.return_response = true;
        self.execute(Command::CallService(call))
            .await
            .map(CommandResult::into_response)
    }

    /// Fire a custom event on the hub bus without waiting.
    pub fn fire_event(&self, event_type: impl Into<String>, data: Option<Value>) {
        let hub = self.clone();
        let event_type = event_type.into();
        let description = format!("fire event {event_type}");
        self.inner.tracker.track(description, async move {
            hub.execute(Command::FireEvent { event_type, data })
                .await
                .map(|_| ())
        });
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn dispatch_task(
    hub: Hub,
    session_id: u64,
    states: Arc<EntityStateCache>,
    mut events: EventStream,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            raw = events.next() => {
                let Some(raw) = raw else { break };
                hub.dispatch(&states, raw);
            }
        }
    }
    hub.session_lost(session_id);
}
