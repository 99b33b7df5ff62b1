// ── Registry cache ──
//
// Denormalized view of the five hub registries plus derived join indices.
// The whole view lives behind one atomically swapped pointer: a reload
// builds a new snapshot (new table, recomputed indices) and swaps it in, so
// readers see either the old view or the new one, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use homesync_api::{
    HubConnection, RawArea, RawDevice, RawEntityEntry, RawFloor, RawLabel, RegistryKind,
};
use tracing::{debug, info};

use crate::convert::decode_records;
use crate::error::CoreError;
use crate::model::{Area, Device, EntityId, EntityRegistration, Floor, Label};

const CACHE_NAME: &str = "registry";

type Table<K, V> = Arc<HashMap<K, Arc<V>>>;
type Index<K, V> = Arc<HashMap<K, Vec<V>>>;

// ── Snapshot ─────────────────────────────────────────────────────────

/// One consistent view of every registry. Cloning is cheap: tables are
/// shared until replaced.
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    entities: Table<EntityId, EntityRegistration>,
    devices: Table<String, Device>,
    areas: Table<String, Area>,
    floors: Table<String, Floor>,
    labels: Table<String, Label>,

    entities_by_area: Index<String, EntityId>,
    entities_by_device: Index<String, EntityId>,
    entities_by_label: Index<String, EntityId>,
    devices_by_area: Index<String, String>,
    areas_by_floor: Index<String, String>,
}

/// Freshly decoded records of one registry.
pub(crate) enum RegistryRecords {
    Entities(Vec<EntityRegistration>),
    Devices(Vec<Device>),
    Areas(Vec<Area>),
    Floors(Vec<Floor>),
    Labels(Vec<Label>),
}

impl RegistryRecords {
    fn decode(kind: RegistryKind, raw: Vec<serde_json::Value>) -> Self {
        match kind {
            RegistryKind::Entity => {
                Self::Entities(decode_records::<RawEntityEntry, EntityRegistration>(kind, raw))
            }
            RegistryKind::Device => Self::Devices(decode_records::<RawDevice, Device>(kind, raw)),
            RegistryKind::Area => Self::Areas(decode_records::<RawArea, Area>(kind, raw)),
            RegistryKind::Floor => Self::Floors(decode_records::<RawFloor, Floor>(kind, raw)),
            RegistryKind::Label => Self::Labels(decode_records::<RawLabel, Label>(kind, raw)),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Entities(v) => v.len(),
            Self::Devices(v) => v.len(),
            Self::Areas(v) => v.len(),
            Self::Floors(v) => v.len(),
            Self::Labels(v) => v.len(),
        }
    }
}

/// Build a table keyed by `key`, skipping records without an id.
fn table<K, V>(records: &[V], key: impl Fn(&V) -> &str) -> Table<K, V>
where
    K: std::hash::Hash + Eq + From<String>,
    V: Clone,
{
    Arc::new(
        records
            .iter()
            .filter(|record| !key(*record).is_empty())
            .map(|record| (K::from(key(record).to_owned()), Arc::new(record.clone())))
            .collect(),
    )
}

fn group<K, V>(pairs: impl Iterator<Item = (K, V)>) -> Index<K, V>
where
    K: std::hash::Hash + Eq,
    V: Ord,
{
    let mut index: HashMap<K, Vec<V>> = HashMap::new();
    for (key, value) in pairs {
        index.entry(key).or_default().push(value);
    }
    for values in index.values_mut() {
        values.sort();
    }
    Arc::new(index)
}

impl RegistrySnapshot {
    /// Copy of `self` with one registry replaced and every dependent index
    /// recomputed.
    pub(crate) fn with_records(&self, records: &RegistryRecords) -> Self {
        let mut next = self.clone();
        match records {
            RegistryRecords::Entities(entities) => {
                next.entities = table(entities, |e| e.entity_id.as_str());
                next.rebuild_entity_indices();
                next.rebuild_entities_by_area();
            }
            RegistryRecords::Devices(devices) => {
                next.devices = table(devices, |d| d.id.as_str());
                next.devices_by_area = group(next.devices.values().filter_map(|d| {
                    d.area_id.as_ref().map(|area| (area.clone(), d.id.clone()))
                }));
                next.rebuild_entities_by_area();
            }
            RegistryRecords::Areas(areas) => {
                next.areas = table(areas, |a| a.id.as_str());
                next.areas_by_floor = group(next.areas.values().filter_map(|a| {
                    a.floor_id.as_ref().map(|floor| (floor.clone(), a.id.clone()))
                }));
            }
            RegistryRecords::Floors(floors) => {
                next.floors = table(floors, |f| f.id.as_str());
            }
            RegistryRecords::Labels(labels) => {
                next.labels = table(labels, |l| l.id.as_str());
            }
        }
        next
    }

    fn rebuild_entity_indices(&mut self) {
        self.entities_by_device = group(self.entities.values().filter_map(|e| {
            e.device_id
                .as_ref()
                .map(|device| (device.clone(), e.entity_id.clone()))
        }));
        self.entities_by_label = group(self.entities.values().flat_map(|e| {
            e.label_ids
                .iter()
                .map(|label| (label.clone(), e.entity_id.clone()))
        }));
    }

    /// Depends on both entities and devices: an entity's own area wins,
    /// otherwise it inherits its device's area.
    fn rebuild_entities_by_area(&mut self) {
        let pairs: Vec<(String, EntityId)> = self
            .entities
            .values()
            .filter_map(|e| self.resolve_area_id(e).map(|area| (area, e.entity_id.clone())))
            .collect();
        self.entities_by_area = group(pairs.into_iter());
    }

    fn resolve_area_id(&self, entity: &EntityRegistration) -> Option<String> {
        entity.area_id.clone().or_else(|| {
            entity
                .device_id
                .as_ref()
                .and_then(|device| self.devices.get(device))
                .and_then(|device| device.area_id.clone())
        })
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn entity_registration(&self, entity_id: &str) -> Option<Arc<EntityRegistration>> {
        self.entities.get(entity_id).cloned()
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.get(device_id).cloned()
    }

    pub fn area(&self, area_id: &str) -> Option<Arc<Area>> {
        self.areas.get(area_id).cloned()
    }

    pub fn floor(&self, floor_id: &str) -> Option<Arc<Floor>> {
        self.floors.get(floor_id).cloned()
    }

    pub fn label(&self, label_id: &str) -> Option<Arc<Label>> {
        self.labels.get(label_id).cloned()
    }

    pub fn entities_for_area(&self, area_id: &str) -> Vec<EntityId> {
        self.entities_by_area.get(area_id).cloned().unwrap_or_default()
    }

    pub fn entities_for_device(&self, device_id: &str) -> Vec<EntityId> {
        self.entities_by_device
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn entities_for_label(&self, label_id: &str) -> Vec<EntityId> {
        self.entities_by_label
            .get(label_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn devices_for_area(&self, area_id: &str) -> Vec<Arc<Device>> {
        self.devices_by_area
            .get(area_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.device(id))
            .collect()
    }

    pub fn areas_for_floor(&self, floor_id: &str) -> Vec<Arc<Area>> {
        self.areas_by_floor
            .get(floor_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.area(id))
            .collect()
    }

    /// Resolved area of an entity (own assignment, else its device's).
    pub fn area_for_entity(&self, entity_id: &str) -> Option<Arc<Area>> {
        let entity = self.entities.get(entity_id)?;
        self.resolve_area_id(entity)
            .and_then(|area_id| self.area(&area_id))
    }

    pub fn floor_for_area(&self, area_id: &str) -> Option<Arc<Floor>> {
        self.area(area_id)?
            .floor_id
            .as_deref()
            .and_then(|floor_id| self.floor(floor_id))
    }

    /// Labels attached to the entity that exist in the label registry.
    pub fn labels_for_entity(&self, entity_id: &str) -> Vec<Arc<Label>> {
        self.entities.get(entity_id).map_or_else(Vec::new, |entity| {
            entity
                .label_ids
                .iter()
                .filter_map(|id| self.label(id))
                .collect()
        })
    }

    pub fn entity_registrations(&self) -> Vec<Arc<EntityRegistration>> {
        sorted(&self.entities, |e| e.entity_id.as_str())
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        sorted(&self.devices, |d| d.id.as_str())
    }

    pub fn areas(&self) -> Vec<Arc<Area>> {
        sorted(&self.areas, |a| a.id.as_str())
    }

    pub fn floors(&self) -> Vec<Arc<Floor>> {
        sorted(&self.floors, |f| f.id.as_str())
    }

    pub fn labels(&self) -> Vec<Arc<Label>> {
        sorted(&self.labels, |l| l.id.as_str())
    }
}

fn sorted<K, V>(table: &Table<K, V>, key: impl Fn(&V) -> &str) -> Vec<Arc<V>> {
    let mut values: Vec<Arc<V>> = table.values().cloned().collect();
    values.sort_by(|a, b| key(a.as_ref()).cmp(key(b.as_ref())));
    values
}

// ── RegistryCache ────────────────────────────────────────────────────

/// Registry view of one session. Empty (and failing reads) until the
/// initial load of all five registries completes.
pub struct RegistryCache {
    snapshot: ArcSwapOption<RegistrySnapshot>,
}

impl RegistryCache {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot.load().is_some()
    }

    /// The current consistent view. Fails until the initial load is done.
    pub fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, CoreError> {
        self.snapshot
            .load_full()
            .ok_or(CoreError::NotInitialized { cache: CACHE_NAME })
    }

    /// Fetch all five registries and publish the first snapshot.
    pub(crate) async fn load_all(&self, connection: &dyn HubConnection) -> Result<(), CoreError> {
        let (entities, devices, areas, floors, labels) = tokio::try_join!(
            fetch(connection, RegistryKind::Entity),
            fetch(connection, RegistryKind::Device),
            fetch(connection, RegistryKind::Area),
            fetch(connection, RegistryKind::Floor),
            fetch(connection, RegistryKind::Label),
        )?;

        // Entities last: their area index needs the devices table.
        let snapshot = RegistrySnapshot::default()
            .with_records(&devices)
            .with_records(&areas)
            .with_records(&floors)
            .with_records(&labels)
            .with_records(&entities);
        info!(
            entities = entities.len(),
            devices = devices.len(),
            areas = areas.len(),
            floors = floors.len(),
            labels = labels.len(),
            "registries loaded"
        );
        self.snapshot.store(Some(Arc::new(snapshot)));
        Ok(())
    }

    /// Reload one registry and swap in the updated view.
    ///
    /// On failure the previous snapshot stays in place and the error is
    /// returned for the caller to log. A cache that was invalidated
    /// meanwhile stays empty.
    pub(crate) async fn reload(
        &self,
        kind: RegistryKind,
        connection: &dyn HubConnection,
    ) -> Result<(), CoreError> {
        let records = fetch(connection, kind).await?;
        self.apply(&records);
        debug!(registry = %kind, records = records.len(), "registry reloaded");
        Ok(())
    }

    pub(crate) fn apply(&self, records: &RegistryRecords) {
        self.snapshot.rcu(|current| {
            current
                .as_ref()
                .map(|snapshot| Arc::new(snapshot.with_records(records)))
        });
    }

    pub(crate) fn invalidate(&self) {
        self.snapshot.store(None);
    }
}

async fn fetch(
    connection: &dyn HubConnection,
    kind: RegistryKind,
) -> Result<RegistryRecords, CoreError> {
    let raw = connection.fetch_registry(kind).await?;
    Ok(RegistryRecords::decode(kind, raw))
}
