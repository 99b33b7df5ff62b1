// ── Filter predicates for event feeds ──

use homesync_api::RegistryKind;

use crate::model::{EntityId, Event};

/// Common predicates over hub events.
pub enum EventFilter {
    All,
    EventType(String),
    /// `state_changed` events of one entity.
    Entity(EntityId),
    /// `state_changed` events of every entity in a domain.
    Domain(String),
    StateChanged,
    /// Registry change notifications; `None` matches all five registries.
    RegistryUpdated(Option<RegistryKind>),
    Custom(Box<dyn Fn(&Event) -> bool + Send + Sync>),
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::EventType(event_type) => event.event_type == *event_type,
            Self::Entity(entity_id) => event
                .state_change()
                .is_some_and(|change| change.entity_id == *entity_id),
            Self::Domain(domain) => event
                .state_change()
                .is_some_and(|change| change.entity_id.domain() == Some(domain.as_str())),
            Self::StateChanged => event.is_state_changed(),
            Self::RegistryUpdated(None) => event.registry_kind().is_some(),
            Self::RegistryUpdated(Some(kind)) => event.registry_kind() == Some(*kind),
            Self::Custom(f) => f(event),
        }
    }
}
