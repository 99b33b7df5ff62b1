// ── Entity state cache ──
//
// Latest known state of every entity, keyed by entity id. Seeded from a
// full snapshot, then kept current by the session's dispatch loop, which
// is the only writer. Readers get `Arc` clones and never see a torn value.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use homesync_api::RawEntityState;
use tracing::{debug, trace};

use crate::error::CoreError;
use crate::model::{EntityId, EntityState, Event, LazyState};

const CACHE_NAME: &str = "entity state";

pub struct EntityStateCache {
    states: DashMap<EntityId, Arc<LazyState>>,
    ready: AtomicBool,
}

impl EntityStateCache {
    pub(crate) fn new() -> Self {
        Self {
            states: DashMap::new(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn ensure_ready(&self) -> Result<(), CoreError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(CoreError::NotInitialized { cache: CACHE_NAME })
        }
    }

    /// Replace the whole map with a fresh snapshot and mark the cache usable.
    ///
    /// Entities present in the map but missing from the snapshot are gone
    /// on the hub and are dropped.
    pub(crate) fn load_snapshot(&self, snapshot: Vec<RawEntityState>) -> usize {
        let mut seen = HashSet::with_capacity(snapshot.len());
        for raw in snapshot {
            let state = Arc::new(EntityState::from(raw));
            let id = state.entity_id.clone();
            self.states
                .insert(id.clone(), Arc::new(LazyState::ready(state)));
            seen.insert(id);
        }
        self.states.retain(|id, _| seen.contains(id));

        self.ready.store(true, Ordering::Release);
        debug!(entities = self.states.len(), "entity state snapshot loaded");
        self.states.len()
    }

    /// Current state of `entity_id`; `Ok(None)` for an unknown entity.
    pub fn get_state(&self, entity_id: &str) -> Result<Option<Arc<EntityState>>, CoreError> {
        self.ensure_ready()?;
        Ok(self
            .states
            .get(entity_id)
            .and_then(|lazy| lazy.value().get()))
    }

    /// Every known entity id, sorted.
    pub fn all_entity_ids(&self) -> Result<Vec<EntityId>, CoreError> {
        self.ensure_ready()?;
        let mut ids: Vec<EntityId> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Apply one event from the live stream.
    ///
    /// Only `state_changed` events touch the map. The new payload is stored
    /// unparsed, backed by the state it replaces in case it turns out to be
    /// malformed; a `null` new state removes the entity.
    pub(crate) fn apply(&self, event: &Event) {
        let Some(change) = event.state_change() else {
            return;
        };
        match change.new_lazy() {
            Some(new_state) => {
                // Linked before the insert so no reader can parse it bare.
                let previous = self
                    .states
                    .get(&change.entity_id)
                    .map(|entry| Arc::clone(entry.value()));
                if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, new_state)) {
                    new_state.set_fallback(previous);
                }
                self.states
                    .insert(change.entity_id.clone(), Arc::clone(new_state));
                trace!(entity_id = %change.entity_id, "entity state updated");
            }
            None => {
                self.states.remove(&change.entity_id);
                debug!(entity_id = %change.entity_id, "entity removed");
            }
        }
    }

    /// Forget everything and refuse reads until the next snapshot.
    pub(crate) fn invalidate(&self) {
        self.ready.store(false, Ordering::Release);
        self.states.clear();
    }
}
