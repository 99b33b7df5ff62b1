// ── Entity handle ──
//
// Typed view of one entity: reads go to the current session's caches,
// streams are derived from the feed the handle was created from (the hub's
// or a scope's), commands go through the hub.

use std::sync::Arc;

use homesync_api::{ServiceCall, ServiceTarget};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CoreError;
use crate::hub::Hub;
use crate::model::{Area, EntityId, EntityRegistration, EntityState, Event, Label, StateChange};
use crate::stream::Feed;

#[derive(Clone)]
pub struct Entity {
    id: EntityId,
    hub: Hub,
    events: Feed<Arc<Event>>,
}

impl Entity {
    pub(crate) fn new(hub: Hub, id: EntityId, events: Feed<Arc<Event>>) -> Self {
        Self { id, hub, events }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn domain(&self) -> Option<&str> {
        self.id.domain()
    }

    // ── State ────────────────────────────────────────────────────

    pub fn entity_state(&self) -> Result<Option<Arc<EntityState>>, CoreError> {
        self.hub.get_state(self.id.as_str())
    }

    /// Primary state value.
    pub fn state(&self) -> Result<Option<String>, CoreError> {
        Ok(self
            .entity_state()?
            .and_then(|state| state.state().map(str::to_owned)))
    }

    pub fn attribute(&self, name: &str) -> Result<Option<Value>, CoreError> {
        Ok(self
            .entity_state()?
            .and_then(|state| state.attribute(name).cloned()))
    }

    /// `true` when the entity currently reports `on`.
    pub fn is_on(&self) -> Result<bool, CoreError> {
        Ok(self.entity_state()?.is_some_and(|state| state.is_on()))
    }

    pub fn is_off(&self) -> Result<bool, CoreError> {
        Ok(self.entity_state()?.is_some_and(|state| state.is_off()))
    }

    /// View of this entity with its state read as a number.
    pub fn as_numeric(&self) -> NumericEntity {
        NumericEntity {
            entity: self.clone(),
        }
    }

    /// Project the attributes into `T`. `Ok(None)` when the entity has no state.
    pub fn attributes_as<T: DeserializeOwned>(&self) -> Result<Option<T>, CoreError> {
        self.entity_state()?
            .map(|state| state.attributes_as::<T>())
            .transpose()
    }

    // ── Streams ──────────────────────────────────────────────────

    /// Every change of this entity, attribute-only ones included.
    pub fn state_all_changes(&self) -> Feed<Arc<StateChange>> {
        self.events.state_all_changes().for_entity(&self.id)
    }

    /// Changes of this entity's primary state value.
    pub fn state_changes(&self) -> Feed<Arc<StateChange>> {
        self.events.state_changes().for_entity(&self.id)
    }

    /// Like [`state_all_changes`](Self::state_all_changes), starting with
    /// one synthetic change from nothing to the state at subscribe time.
    pub fn state_all_changes_with_current(&self) -> Feed<Arc<StateChange>> {
        self.state_all_changes().with_current(self.current())
    }

    pub fn state_changes_with_current(&self) -> Feed<Arc<StateChange>> {
        self.state_changes().with_current(self.current())
    }

    /// Before the first snapshot there is no current value to report: the
    /// read error is logged by the feed and no synthetic change is sent.
    fn current(
        &self,
    ) -> impl Fn() -> Result<Option<Arc<StateChange>>, CoreError> + Send + Sync + 'static {
        let hub = self.hub.clone();
        let id = self.id.clone();
        move || {
            let state = hub.get_state(id.as_str())?;
            Ok(Some(Arc::new(StateChange::current(id.clone(), state))))
        }
    }

    // ── Registry ─────────────────────────────────────────────────

    pub fn registration(&self) -> Result<Option<Arc<EntityRegistration>>, CoreError> {
        self.hub.get_entity_registration(self.id.as_str())
    }

    /// Area of the entity, inherited from its device when not set directly.
    pub fn area(&self) -> Result<Option<Arc<Area>>, CoreError> {
        self.hub.area_for_entity(self.id.as_str())
    }

    pub fn labels(&self) -> Result<Vec<Arc<Label>>, CoreError> {
        self.hub.labels_for_entity(self.id.as_str())
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Call a service targeting this entity without waiting.
    ///
    /// `service` is either `"domain.service"` or a bare service name, in
    /// which case the entity's own domain is used.
    pub fn call_service(&self, service: &str, data: Option<Value>) -> Result<(), CoreError> {
        let call = self.service_call(service, data)?;
        self.hub.call_service(call);
        Ok(())
    }

    /// Call a service targeting this entity and wait for its response.
    pub async fn call_service_with_response(
        &self,
        service: &str,
        data: Option<Value>,
    ) -> Result<Option<Value>, CoreError> {
        let call = self.service_call(service, data)?;
        self.hub.call_service_with_response(call).await
    }

    fn service_call(&self, service: &str, data: Option<Value>) -> Result<ServiceCall, CoreError> {
        let (domain, service) = match service.split_once('.') {
            Some((domain, service)) => (domain, service),
            None => {
                let domain = self.id.domain().ok_or_else(|| CoreError::ValidationFailed {
                    message: format!(
                        "entity id '{}' has no domain, use 'domain.service'",
                        self.id
                    ),
                })?;
                (domain, service)
            }
        };
        if domain.is_empty() || service.is_empty() {
            return Err(CoreError::ValidationFailed {
                message: format!("invalid service name '{domain}.{service}'"),
            });
        }
        Ok(ServiceCall {
            domain: domain.to_owned(),
            service: service.to_owned(),
            target: Some(ServiceTarget::from_entity(self.id.as_str())),
            data,
            return_response: false,
        })
    }
}

// ── NumericEntity ────────────────────────────────────────────────

/// An [`Entity`] whose state is a number, such as a sensor reading.
#[derive(Clone, Debug)]
pub struct NumericEntity {
    entity: Entity,
}

impl NumericEntity {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Current state as a number; `Ok(None)` when absent or not numeric.
    pub fn state(&self) -> Result<Option<f64>, CoreError> {
        Ok(self
            .entity
            .entity_state()?
            .and_then(|state| state.numeric_state()))
    }

    /// Numeric transitions of this entity as `(old, new)` pairs.
    pub fn state_changes(&self) -> Feed<(Option<f64>, Option<f64>)> {
        self.entity.state_changes().map(|change| {
            (
                change.old().and_then(|s| s.numeric_state()),
                change.new_state().and_then(|s| s.numeric_state()),
            )
        })
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity").field("id", &self.id).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bare_service_uses_entity_domain() {
        let entity = Hub::default().entity("light.kitchen");
        let call = entity.service_call("turn_on", None).unwrap();
        assert_eq!(call.domain, "light");
        assert_eq!(call.service, "turn_on");
        assert_eq!(
            call.target.unwrap().entity_ids,
            vec!["light.kitchen".to_owned()]
        );
    }

    #[test]
    fn qualified_service_overrides_domain() {
        let entity = Hub::default().entity("light.kitchen");
        let call = entity.service_call("homeassistant.toggle", None).unwrap();
        assert_eq!(call.domain, "homeassistant");
        assert_eq!(call.service, "toggle");
    }

    #[test]
    fn missing_domain_is_rejected() {
        let entity = Hub::default().entity("kitchen");
        assert!(matches!(
            entity.service_call("turn_on", None),
            Err(CoreError::ValidationFailed { .. })
        ));
        assert!(entity.service_call(".turn_on", None).is_err());
    }

    #[test]
    fn with_current_before_connect_sends_nothing() {
        let entity = Hub::default().entity("light.kitchen");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = entity
            .state_all_changes_with_current()
            .subscribe(move |change| {
                sink.lock().push((change.old_value(), change.new_value()));
                Ok(())
            });

        assert!(seen.lock().is_empty());
        assert!(entity.is_on().is_err());
        assert!(entity.as_numeric().state().is_err());
    }
}
