// ── Wire-to-domain conversions ──
//
// Bridges `homesync_api` wire records into `homesync_core::model` types.
// Empty-string foreign keys are normalized to `None` so "unassigned" has a
// single representation.

use homesync_api::{
    RawArea, RawContext, RawDevice, RawEntityEntry, RawEntityState, RawEvent, RawFloor, RawLabel,
    RegistryKind,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::model::state::non_empty_id as non_empty;
use crate::model::{
    Area, Context, Device, EntityId, EntityRegistration, EntityState, Event, Floor, Label,
};

// ── Helpers ────────────────────────────────────────────────────────

/// Decode a raw registry listing, skipping (and logging) malformed records.
pub(crate) fn decode_records<R, T>(kind: RegistryKind, records: Vec<Value>) -> Vec<T>
where
    R: DeserializeOwned,
    T: From<R>,
{
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<R>(record) {
            Ok(raw) => Some(T::from(raw)),
            Err(e) => {
                warn!(registry = %kind, error = %e, "skipping malformed registry record");
                None
            }
        })
        .collect()
}

// ── States and events ──────────────────────────────────────────────

impl From<RawContext> for Context {
    fn from(raw: RawContext) -> Self {
        Self {
            id: raw.id,
            parent_id: non_empty(raw.parent_id),
            user_id: non_empty(raw.user_id),
        }
    }
}

impl From<RawEntityState> for EntityState {
    fn from(raw: RawEntityState) -> Self {
        Self {
            entity_id: EntityId::from(raw.entity_id),
            state: raw.state,
            attributes: raw.attributes,
            last_changed: raw.last_changed,
            last_updated: raw.last_updated,
            context: raw.context.map(Context::from),
        }
    }
}

impl From<RawEvent> for Event {
    fn from(raw: RawEvent) -> Self {
        Event::new(
            raw.event_type,
            raw.data,
            raw.origin,
            raw.time_fired,
            raw.context.map(Context::from),
        )
    }
}

// ── Registries ─────────────────────────────────────────────────────

impl From<RawEntityEntry> for EntityRegistration {
    fn from(raw: RawEntityEntry) -> Self {
        Self {
            entity_id: EntityId::from(raw.entity_id),
            name: non_empty(raw.name),
            original_name: non_empty(raw.original_name),
            platform: raw.platform,
            icon: raw.icon,
            device_id: non_empty(raw.device_id),
            area_id: non_empty(raw.area_id),
            label_ids: raw.labels,
            disabled: raw.disabled_by.is_some(),
            hidden: raw.hidden_by.is_some(),
        }
    }
}

impl From<RawDevice> for Device {
    fn from(raw: RawDevice) -> Self {
        Self {
            id: raw.id,
            name: non_empty(raw.name),
            name_by_user: non_empty(raw.name_by_user),
            manufacturer: raw.manufacturer,
            model: raw.model,
            sw_version: raw.sw_version,
            hw_version: raw.hw_version,
            serial_number: raw.serial_number,
            configuration_url: raw.configuration_url,
            via_device_id: non_empty(raw.via_device_id),
            area_id: non_empty(raw.area_id),
            label_ids: raw.labels,
        }
    }
}

impl From<RawArea> for Area {
    fn from(raw: RawArea) -> Self {
        Self {
            id: raw.area_id,
            name: raw.name,
            floor_id: non_empty(raw.floor_id),
            label_ids: raw.labels,
            icon: raw.icon,
            aliases: raw.aliases,
        }
    }
}

impl From<RawFloor> for Floor {
    fn from(raw: RawFloor) -> Self {
        Self {
            id: raw.floor_id,
            name: raw.name,
            level: raw.level,
            icon: raw.icon,
            aliases: raw.aliases,
        }
    }
}

impl From<RawLabel> for Label {
    fn from(raw: RawLabel) -> Self {
        Self {
            id: raw.label_id,
            name: raw.name,
            color: raw.color,
            icon: raw.icon,
            description: raw.description,
        }
    }
}
