//! In-process [`HubConnection`] backed by plain tables.
//!
//! Serves snapshots from memory, lets the caller push events into every
//! open subscription, and records the commands it receives. Used by the
//! test suites of this workspace and handy for offline tooling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::connection::{EventStream, HubConnection};
use crate::error::Error;
use crate::types::{RawContext, RawEntityState, RawEvent, RegistryKind, STATE_CHANGED, ServiceCall};

/// Calls that can be made to fail once via [`MemoryConnection::fail_next`]
/// or held open via [`MemoryConnection::hold_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    States,
    Registry(RegistryKind),
    Subscribe,
    CallService,
    FireEvent,
}

type StateFetchHook = Box<dyn FnOnce(&MemoryConnection) + Send>;

#[derive(Default)]
pub struct MemoryConnection {
    states: Mutex<Vec<RawEntityState>>,
    registries: Mutex<HashMap<RegistryKind, Vec<Value>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RawEvent>>>,
    failures: Mutex<HashSet<FailPoint>>,
    holds: Mutex<HashMap<FailPoint, Arc<Notify>>>,
    responses: Mutex<HashMap<(String, String), Value>>,
    before_state_fetch: Mutex<Option<StateFetchHook>>,

    service_calls: Mutex<Vec<ServiceCall>>,
    fired_events: Mutex<Vec<(String, Option<Value>)>>,
    registry_fetches: Mutex<HashMap<RegistryKind, usize>>,
    state_fetches: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding ──────────────────────────────────────────────────────

    pub fn with_state(self, state: RawEntityState) -> Self {
        self.set_state(state);
        self
    }

    pub fn with_registry(self, kind: RegistryKind, records: Vec<Value>) -> Self {
        self.set_registry(kind, records);
        self
    }

    /// Insert or replace one entity in the snapshot table.
    pub fn set_state(&self, state: RawEntityState) -> Option<RawEntityState> {
        let mut states = self.states.lock();
        if let Some(slot) = states.iter_mut().find(|s| s.entity_id == state.entity_id) {
            return Some(std::mem::replace(slot, state));
        }
        states.push(state);
        None
    }

    pub fn remove_state(&self, entity_id: &str) -> Option<RawEntityState> {
        let mut states = self.states.lock();
        let index = states.iter().position(|s| s.entity_id == entity_id)?;
        Some(states.remove(index))
    }

    pub fn set_registry(&self, kind: RegistryKind, records: Vec<Value>) {
        self.registries.lock().insert(kind, records);
    }

    /// Canned response for `domain.service` when a response is requested.
    pub fn respond_with(&self, domain: &str, service: &str, response: Value) {
        self.responses
            .lock()
            .insert((domain.to_owned(), service.to_owned()), response);
    }

    /// Make the next call at `point` fail with a transport error.
    pub fn fail_next(&self, point: FailPoint) {
        self.failures.lock().insert(point);
    }

    /// Make the next call at `point` wait until the returned handle is
    /// notified. The call is already counted while it waits.
    pub fn hold_next(&self, point: FailPoint) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        self.holds.lock().insert(point, Arc::clone(&release));
        release
    }

    /// Run `hook` at the start of the next state snapshot fetch, after the
    /// event subscription of a connecting client is already open.
    pub fn on_next_state_fetch(&self, hook: impl FnOnce(&MemoryConnection) + Send + 'static) {
        *self.before_state_fetch.lock() = Some(Box::new(hook));
    }

    // ── Event injection ──────────────────────────────────────────────

    /// Deliver `event` to every open subscription. Returns how many received it.
    pub fn push_event(&self, event: RawEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subscribers.iter() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(event_type = %event.event_type, delivered, "memory hub pushed event");
        delivered
    }

    /// Update the snapshot table and announce the change as `state_changed`.
    pub fn push_state(&self, new_state: RawEntityState) -> Result<usize, Error> {
        let entity_id = new_state.entity_id.clone();
        let old_state = self.set_state(new_state.clone());
        self.push_state_event(&entity_id, old_state.as_ref(), Some(&new_state))
    }

    /// Drop the entity from the snapshot table and announce the removal.
    pub fn push_removal(&self, entity_id: &str) -> Result<usize, Error> {
        let old_state = self.remove_state(entity_id);
        self.push_state_event(entity_id, old_state.as_ref(), None)
    }

    /// Announce that a registry changed without touching the table.
    pub fn push_registry_update(&self, kind: RegistryKind) -> Result<usize, Error> {
        let event = RawEvent::new(kind.update_event(), &json!({ "action": "update" }))?;
        Ok(self.push_event(event))
    }

    fn push_state_event(
        &self,
        entity_id: &str,
        old_state: Option<&RawEntityState>,
        new_state: Option<&RawEntityState>,
    ) -> Result<usize, Error> {
        let data = json!({
            "entity_id": entity_id,
            "old_state": old_state,
            "new_state": new_state,
        });
        let mut event = RawEvent::new(STATE_CHANGED, &data)?;
        event.context = Some(RawContext {
            id: Uuid::new_v4().simple().to_string(),
            parent_id: None,
            user_id: None,
        });
        Ok(self.push_event(event))
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// End every open event stream and refuse further calls.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().clear();
        debug!("memory hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn service_calls(&self) -> Vec<ServiceCall> {
        self.service_calls.lock().clone()
    }

    pub fn fired_events(&self) -> Vec<(String, Option<Value>)> {
        self.fired_events.lock().clone()
    }

    pub fn registry_fetches(&self, kind: RegistryKind) -> usize {
        self.registry_fetches.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn state_fetches(&self) -> usize {
        self.state_fetches.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    async fn pass(&self, point: FailPoint) -> Result<(), Error> {
        let hold = self.holds.lock().remove(&point);
        if let Some(release) = hold {
            debug!(?point, "memory hub holding call");
            release.notified().await;
        }
        self.check(point)
    }

    fn check(&self, point: FailPoint) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.failures.lock().remove(&point) {
            return Err(Error::Transport(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

impl HubConnection for MemoryConnection {
    fn fetch_states(&self) -> BoxFuture<'_, Result<Vec<RawEntityState>, Error>> {
        Box::pin(async move {
            let hook = self.before_state_fetch.lock().take();
            if let Some(hook) = hook {
                hook(self);
            }
            self.state_fetches.fetch_add(1, Ordering::SeqCst);
            self.pass(FailPoint::States).await?;
            Ok(self.states.lock().clone())
        })
    }

    fn fetch_registry(&self, kind: RegistryKind) -> BoxFuture<'_, Result<Vec<Value>, Error>> {
        Box::pin(async move {
            *self.registry_fetches.lock().entry(kind).or_default() += 1;
            self.pass(FailPoint::Registry(kind)).await?;
            Ok(self
                .registries
                .lock()
                .get(&kind)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn subscribe_events(&self) -> BoxFuture<'_, Result<EventStream, Error>> {
        Box::pin(async move {
            self.pass(FailPoint::Subscribe).await?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.subscribers.lock().push(tx);
            let stream = async_stream::stream! {
                while let Some(event) = rx.recv().await {
                    yield event;
                }
            };
            Ok(stream.boxed())
        })
    }

    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, Result<Option<Value>, Error>> {
        Box::pin(async move {
            self.pass(FailPoint::CallService).await?;
            let response = if call.return_response {
                self.responses
                    .lock()
                    .get(&(call.domain.clone(), call.service.clone()))
                    .cloned()
            } else {
                None
            };
            debug!(domain = %call.domain, service = %call.service, "memory hub service call");
            self.service_calls.lock().push(call);
            Ok(response)
        })
    }

    fn fire_event(
        &self,
        event_type: String,
        data: Option<Value>,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.pass(FailPoint::FireEvent).await?;
            self.fired_events.lock().push((event_type, data));
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_pushed_states() {
        let hub = MemoryConnection::new().with_state(RawEntityState::new("light.kitchen", "off"));
        hub.push_state(RawEntityState::new("light.kitchen", "on"))
            .unwrap();

        let states = hub.fetch_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state.as_deref(), Some("on"));
        assert_eq!(hub.state_fetches(), 1);
    }

    #[tokio::test]
    async fn subscription_receives_events_and_ends_on_close() {
        let hub = MemoryConnection::new();
        let mut events = hub.subscribe_events().await.unwrap();

        assert_eq!(hub.push_registry_update(RegistryKind::Area).unwrap(), 1);
        let event = events.next().await.unwrap();
        assert_eq!(event.registry_kind(), Some(RegistryKind::Area));

        hub.close();
        assert!(events.next().await.is_none());
        assert!(matches!(
            hub.fetch_states().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let hub = MemoryConnection::new();
        hub.fail_next(FailPoint::Registry(RegistryKind::Floor));

        assert!(hub.fetch_registry(RegistryKind::Floor).await.is_err());
        assert!(hub.fetch_registry(RegistryKind::Floor).await.is_ok());
        assert_eq!(hub.registry_fetches(RegistryKind::Floor), 2);
    }

    #[tokio::test]
    async fn service_calls_are_recorded_with_responses() {
        let hub = MemoryConnection::new();
        hub.respond_with("weather", "get_forecasts", json!({"ok": true}));

        let call = ServiceCall {
            domain: "weather".into(),
            service: "get_forecasts".into(),
            target: None,
            data: None,
            return_response: true,
        };
        let response = hub.call_service(call).await.unwrap();
        assert_eq!(response, Some(json!({"ok": true})));
        assert_eq!(hub.service_calls().len(), 1);
    }

    #[tokio::test]
    async fn held_call_waits_for_release() {
        let hub = Arc::new(MemoryConnection::new());
        let release = hub.hold_next(FailPoint::Registry(RegistryKind::Area));

        let fetching = Arc::clone(&hub);
        let fetch =
            tokio::spawn(async move { fetching.fetch_registry(RegistryKind::Area).await });
        while hub.registry_fetches(RegistryKind::Area) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!fetch.is_finished());

        release.notify_one();
        assert!(fetch.await.unwrap().is_ok());
        // Only the next call is held.
        assert!(hub.fetch_registry(RegistryKind::Area).await.is_ok());
    }
}
