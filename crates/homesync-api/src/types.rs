//! Wire-level records exchanged with the hub.
//!
//! These mirror what the hub sends, field for field. Nothing here is
//! interpreted: `homesync-core` converts them into its domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use strum::{AsRefStr, Display};

use crate::error::Error;

/// Event type of the per-entity state change notification.
pub const STATE_CHANGED: &str = "state_changed";

// ── Events ───────────────────────────────────────────────────────────

/// Causality context attached to states and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContext {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// One event from the hub's live event stream.
///
/// `data` stays unparsed so consumers can discriminate on `event_type`
/// without paying for payloads nobody reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_type: String,
    pub data: Box<RawValue>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<RawContext>,
}

impl RawEvent {
    /// Build an event from any serializable payload.
    pub fn new(event_type: impl Into<String>, data: &impl Serialize) -> Result<Self, Error> {
        let data = serde_json::value::to_raw_value(data).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })?;
        Ok(Self {
            event_type: event_type.into(),
            data,
            origin: Some("LOCAL".into()),
            time_fired: Some(Utc::now()),
            context: None,
        })
    }

    /// Parse a single event frame as the hub sends it.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::deserialization(&e, text))
    }

    pub fn is_state_changed(&self) -> bool {
        self.event_type == STATE_CHANGED
    }

    /// The registry this event announces a change for, if any.
    pub fn registry_kind(&self) -> Option<RegistryKind> {
        RegistryKind::from_update_event(&self.event_type)
    }
}

// ── States ───────────────────────────────────────────────────────────

/// Full state of one entity as returned by the state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntityState {
    pub entity_id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<RawContext>,
}

impl RawEntityState {
    /// Minimal state with no attributes, stamped with the current time.
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            state: Some(state.into()),
            attributes: Map::new(),
            last_changed: Some(now),
            last_updated: Some(now),
            context: None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// ── Registries ───────────────────────────────────────────────────────

/// The five hub-side registries mirrored by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    Entity,
    Device,
    Area,
    Label,
    Floor,
}

impl RegistryKind {
    pub const ALL: [Self; 5] = [
        Self::Entity,
        Self::Device,
        Self::Area,
        Self::Label,
        Self::Floor,
    ];

    /// Event type the hub fires when this registry changes.
    pub fn update_event(self) -> &'static str {
        match self {
            Self::Entity => "entity_registry_updated",
            Self::Device => "device_registry_updated",
            Self::Area => "area_registry_updated",
            Self::Label => "label_registry_updated",
            Self::Floor => "floor_registry_updated",
        }
    }

    pub fn from_update_event(event_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.update_event() == event_type)
    }
}

/// Entry of the entity registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntityEntry {
    pub entity_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub disabled_by: Option<String>,
    #[serde(default)]
    pub hidden_by: Option<String>,
}

/// Entry of the device registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDevice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_by_user: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sw_version: Option<String>,
    #[serde(default)]
    pub hw_version: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub configuration_url: Option<String>,
    #[serde(default)]
    pub via_device_id: Option<String>,
}

/// Entry of the area registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArea {
    #[serde(alias = "id")]
    pub area_id: String,
    pub name: String,
    #[serde(default)]
    pub floor_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Entry of the floor registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFloor {
    pub floor_id: String,
    pub name: String,
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Entry of the label registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLabel {
    pub label_id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// ── Commands ─────────────────────────────────────────────────────────

/// Target of a service call. Empty lists are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    #[serde(rename = "entity_id", default, skip_serializing_if = "Vec::is_empty")]
    pub entity_ids: Vec<String>,
    #[serde(rename = "device_id", default, skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,
    #[serde(rename = "area_id", default, skip_serializing_if = "Vec::is_empty")]
    pub area_ids: Vec<String>,
    #[serde(rename = "floor_id", default, skip_serializing_if = "Vec::is_empty")]
    pub floor_ids: Vec<String>,
    #[serde(rename = "label_id", default, skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<String>,
}

impl ServiceTarget {
    pub fn from_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_ids: vec![entity_id.into()],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
            && self.device_ids.is_empty()
            && self.area_ids.is_empty()
            && self.floor_ids.is_empty()
            && self.label_ids.is_empty()
    }
}

/// A `call_service` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ServiceTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub return_response: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_keeps_payload_unparsed() {
        let text = r#"{
            "event_type": "state_changed",
            "data": {"entity_id": "light.kitchen", "old_state": null, "new_state": null},
            "origin": "LOCAL",
            "time_fired": "2026-03-01T10:00:00Z",
            "context": {"id": "01HQ", "parent_id": null, "user_id": null}
        }"#;

        let event = RawEvent::from_json(text).unwrap();
        assert!(event.is_state_changed());
        assert!(event.data.get().contains("light.kitchen"));
        assert_eq!(event.context.unwrap().id, "01HQ");
    }

    #[test]
    fn registry_kind_round_trips_update_events() {
        for kind in RegistryKind::ALL {
            assert_eq!(RegistryKind::from_update_event(kind.update_event()), Some(kind));
        }
        assert_eq!(RegistryKind::from_update_event("state_changed"), None);
        assert_eq!(RegistryKind::Floor.to_string(), "floor");
    }

    #[test]
    fn area_accepts_id_alias() {
        let area: RawArea =
            serde_json::from_value(serde_json::json!({"id": "kitchen", "name": "Kitchen"}))
                .unwrap();
        assert_eq!(area.area_id, "kitchen");
        assert!(area.floor_id.is_none());
    }

    #[test]
    fn service_target_omits_empty_lists() {
        let target = ServiceTarget::from_entity("light.kitchen");
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json, serde_json::json!({"entity_id": ["light.kitchen"]}));
        assert!(ServiceTarget::default().is_empty());
    }

    #[test]
    fn entity_state_builder() {
        let state = RawEntityState::new("sensor.temp", "21.5").with_attribute("unit", "°C");
        assert_eq!(state.state.as_deref(), Some("21.5"));
        assert_eq!(state.attributes["unit"], "°C");
    }
}
