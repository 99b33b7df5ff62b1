// ── Hub events ──

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use homesync_api::{RegistryKind, STATE_CHANGED};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tracing::warn;

use super::entity_id::EntityId;
use super::state::{Context, EntityState, LazyState};
use crate::error::CoreError;

/// One event from the hub bus.
///
/// The payload stays raw. `state_change()` parses just enough of a
/// `state_changed` payload to route it and memoizes the result, so the
/// cache and every subscriber share one parse.
pub struct Event {
    pub event_type: String,
    pub origin: Option<String>,
    pub time_fired: Option<DateTime<Utc>>,
    pub context: Option<Context>,
    data: Box<RawValue>,
    state_change: OnceLock<Option<Arc<StateChange>>>,
}

/// Routing fields of a `state_changed` payload. The two states are only
/// located, not parsed.
#[derive(Deserialize)]
struct StateChangedData<'a> {
    entity_id: String,
    #[serde(borrow, default)]
    old_state: Option<&'a RawValue>,
    #[serde(borrow, default)]
    new_state: Option<&'a RawValue>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        data: Box<RawValue>,
        origin: Option<String>,
        time_fired: Option<DateTime<Utc>>,
        context: Option<Context>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            origin,
            time_fired,
            context,
            data,
            state_change: OnceLock::new(),
        }
    }

    pub fn data(&self) -> &RawValue {
        &self.data
    }

    /// Deserialize the payload into a caller-chosen shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_str(self.data.get())
            .map_err(|e| CoreError::decode(format!("{} payload", self.event_type), &e))
    }

    pub fn is_state_changed(&self) -> bool {
        self.event_type == STATE_CHANGED
    }

    /// The registry this event reports a change for, if any.
    pub fn registry_kind(&self) -> Option<RegistryKind> {
        RegistryKind::from_update_event(&self.event_type)
    }

    /// The state transition carried by a `state_changed` event.
    ///
    /// `None` for every other event type and for malformed payloads (logged
    /// once).
    pub fn state_change(&self) -> Option<Arc<StateChange>> {
        self.state_change
            .get_or_init(|| self.parse_state_change())
            .clone()
    }

    fn parse_state_change(&self) -> Option<Arc<StateChange>> {
        if !self.is_state_changed() {
            return None;
        }
        match serde_json::from_str::<StateChangedData<'_>>(self.data.get()) {
            Ok(data) => Some(Arc::new(StateChange {
                entity_id: EntityId::from(data.entity_id),
                old: data.old_state.and_then(lazy_payload),
                new: data.new_state.and_then(lazy_payload),
            })),
            Err(e) => {
                warn!(
                    event_type = %self.event_type,
                    error = %e,
                    "skipping malformed state_changed payload"
                );
                None
            }
        }
    }
}

/// `null` inside an `Option<&RawValue>` may surface as a literal raw `null`.
fn lazy_payload(raw: &RawValue) -> Option<Arc<LazyState>> {
    if raw.get() == "null" {
        None
    } else {
        Some(Arc::new(LazyState::from_raw(raw.to_owned())))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .field("origin", &self.origin)
            .field("time_fired", &self.time_fired)
            .field("data", &self.data.get())
            .finish_non_exhaustive()
    }
}

// ── StateChange ──────────────────────────────────────────────────────

/// Old and new state of one entity. Either side may be absent: no old state
/// for a newly created entity, no new state for a removed one.
#[derive(Debug)]
pub struct StateChange {
    pub entity_id: EntityId,
    old: Option<Arc<LazyState>>,
    new: Option<Arc<LazyState>>,
}

impl StateChange {
    pub fn new(
        entity_id: EntityId,
        old: Option<Arc<EntityState>>,
        new: Option<Arc<EntityState>>,
    ) -> Self {
        Self {
            entity_id,
            old: old.map(|s| Arc::new(LazyState::ready(s))),
            new: new.map(|s| Arc::new(LazyState::ready(s))),
        }
    }

    /// Synthetic change describing the current value: no old state.
    pub fn current(entity_id: EntityId, state: Option<Arc<EntityState>>) -> Self {
        Self::new(entity_id, None, state)
    }

    pub fn old(&self) -> Option<Arc<EntityState>> {
        self.old.as_ref().and_then(|lazy| lazy.get())
    }

    pub fn new_state(&self) -> Option<Arc<EntityState>> {
        self.new.as_ref().and_then(|lazy| lazy.get())
    }

    /// The unparsed new state as it will be stored in the cache.
    pub(crate) fn new_lazy(&self) -> Option<&Arc<LazyState>> {
        self.new.as_ref()
    }

    pub fn old_value(&self) -> Option<String> {
        self.old().and_then(|s| s.state.clone())
    }

    pub fn new_value(&self) -> Option<String> {
        self.new_state().and_then(|s| s.state.clone())
    }

    /// `true` when the primary state value differs, not just attributes.
    pub fn is_state_transition(&self) -> bool {
        self.old_value() != self.new_value()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, data: &serde_json::Value) -> Event {
        Event::new(
            event_type,
            serde_json::value::to_raw_value(data).unwrap(),
            None,
            None,
            None,
        )
    }

    #[test]
    fn state_change_is_parsed_once_and_shared() {
        let ev = event(
            STATE_CHANGED,
            &json!({
                "entity_id": "light.kitchen",
                "old_state": {"entity_id": "light.kitchen", "state": "off"},
                "new_state": {"entity_id": "light.kitchen", "state": "on"}
            }),
        );
        let first = ev.state_change().unwrap();
        let second = ev.state_change().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.entity_id.as_str(), "light.kitchen");
        assert_eq!(first.old_value().as_deref(), Some("off"));
        assert_eq!(first.new_value().as_deref(), Some("on"));
        assert!(first.is_state_transition());
    }

    #[test]
    fn null_new_state_means_removal() {
        let ev = event(
            STATE_CHANGED,
            &json!({"entity_id": "light.gone", "old_state": null, "new_state": null}),
        );
        let change = ev.state_change().unwrap();
        assert!(change.new_lazy().is_none());
        assert!(change.old().is_none());
        assert!(!change.is_state_transition());
    }

    #[test]
    fn attribute_only_change_is_not_a_transition() {
        let change = StateChange::new(
            EntityId::from("light.kitchen"),
            Some(Arc::new(
                serde_json::from_value(json!({"entity_id": "light.kitchen", "state": "on"}))
                    .unwrap(),
            )),
            Some(Arc::new(
                serde_json::from_value(json!({
                    "entity_id": "light.kitchen",
                    "state": "on",
                    "attributes": {"brightness": 10}
                }))
                .unwrap(),
            )),
        );
        assert!(!change.is_state_transition());
    }

    #[test]
    fn other_events_have_no_state_change() {
        let ev = event("call_service", &json!({"domain": "light"}));
        assert!(ev.state_change().is_none());

        #[derive(Deserialize)]
        struct CallService {
            domain: String,
        }
        assert_eq!(ev.data_as::<CallService>().unwrap().domain, "light");
    }

    #[test]
    fn malformed_state_changed_payload_is_skipped() {
        let ev = event(STATE_CHANGED, &json!({"old_state": null}));
        assert!(ev.state_change().is_none());
    }
}
