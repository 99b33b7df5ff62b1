// ── Entity state ──
//
// `EntityState` is an immutable snapshot: a newer state for the same entity
// replaces the old `Arc`, it never mutates it. `LazyState` defers parsing of
// a state payload until somebody actually reads it.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use tracing::warn;

use super::entity_id::EntityId;
use crate::error::CoreError;

/// Causality context correlating a change with the action that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(default, deserialize_with = "non_empty")]
    pub parent_id: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub user_id: Option<String>,
}

/// Empty strings mean "unset" on the wire.
pub(crate) fn non_empty_id(raw: Option<String>) -> Option<String> {
    raw.filter(|s| !s.is_empty())
}

fn non_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Option::<String>::deserialize(deserializer).map(non_empty_id)
}

/// Latest known state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<Context>,
}

impl EntityState {
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// `true` when the state is `on`, ignoring case.
    pub fn is_on(&self) -> bool {
        self.state().is_some_and(|s| s.eq_ignore_ascii_case("on"))
    }

    /// `true` when the state is `off`, ignoring case.
    pub fn is_off(&self) -> bool {
        self.state().is_some_and(|s| s.eq_ignore_ascii_case("off"))
    }

    /// The state read as a number; `None` for `unavailable`, `unknown` and
    /// anything else that does not parse.
    pub fn numeric_state(&self) -> Option<f64> {
        self.state()?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
    }

    /// Project the attribute map onto a caller-chosen shape.
    ///
    /// Parses on every call; use [`EntityState::typed`] when the projection
    /// is read repeatedly.
    pub fn attributes_as<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
            .map_err(|e| CoreError::decode(format!("attributes of {}", self.entity_id), &e))
    }

    /// Wrap this state with a memoized typed attribute projection.
    pub fn typed<T: DeserializeOwned>(self: &Arc<Self>) -> TypedState<T> {
        TypedState::new(Arc::clone(self))
    }
}

// ── TypedState ───────────────────────────────────────────────────────

/// An [`EntityState`] plus its attributes projected onto `T`.
///
/// The projection runs on first access only. Concurrent first readers
/// block on a single computation and share its result.
pub struct TypedState<T> {
    state: Arc<EntityState>,
    attributes: OnceLock<Result<T, String>>,
}

impl<T: DeserializeOwned> TypedState<T> {
    pub fn new(state: Arc<EntityState>) -> Self {
        Self {
            state,
            attributes: OnceLock::new(),
        }
    }

    pub fn state(&self) -> &Arc<EntityState> {
        &self.state
    }

    pub fn attributes(&self) -> Result<&T, CoreError> {
        self.attributes
            .get_or_init(|| self.state.attributes_as::<T>().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|message| CoreError::Deserialization {
                what: format!("attributes of {}", self.state.entity_id),
                message: message.clone(),
            })
    }
}

impl<T> fmt::Debug for TypedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedState")
            .field("state", &self.state)
            .field("projected", &self.attributes.get().is_some())
            .finish()
    }
}

// ── LazyState ────────────────────────────────────────────────────────

/// A state payload kept as raw JSON until first read.
///
/// Most state changes are never inspected by anyone, so the parse is paid
/// for only on demand and then memoized. A payload that fails to parse is
/// logged once and reads as the state it replaced, if the cache gave it
/// one, otherwise as "no state".
pub struct LazyState {
    raw: Option<Box<RawValue>>,
    parsed: OnceLock<Option<Arc<EntityState>>>,
    /// Previous state of the entity. Dropped once this payload is parsed.
    fallback: Mutex<Option<Arc<LazyState>>>,
}

impl LazyState {
    pub fn from_raw(raw: Box<RawValue>) -> Self {
        Self {
            raw: Some(raw),
            parsed: OnceLock::new(),
            fallback: Mutex::new(None),
        }
    }

    /// An already parsed state (snapshot loads, synthetic changes).
    pub fn ready(state: Arc<EntityState>) -> Self {
        Self {
            raw: None,
            parsed: OnceLock::from(Some(state)),
            fallback: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<EntityState>> {
        self.parsed.get_or_init(|| self.parse()).clone()
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed.get().is_some()
    }

    /// Read as `previous` if this payload turns out to be malformed.
    ///
    /// At most one unresolved link is kept: a `previous` that still waits
    /// on a fallback of its own is resolved first.
    pub(crate) fn set_fallback(&self, previous: Arc<LazyState>) {
        if self.is_parsed() {
            return;
        }
        if previous.fallback.lock().is_some() {
            previous.get();
        }
        *self.fallback.lock() = Some(previous);
    }

    fn parse(&self) -> Option<Arc<EntityState>> {
        let fallback = self.fallback.lock().take();
        let raw = self.raw.as_ref()?;
        match serde_json::from_str::<Option<EntityState>>(raw.get()) {
            Ok(state) => state.map(Arc::new),
            Err(e) => {
                warn!(
                    error = %e,
                    keeps_previous = fallback.is_some(),
                    "skipping malformed entity state payload"
                );
                fallback.and_then(|previous| previous.get())
            }
        }
    }
}

impl fmt::Debug for LazyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parsed.get() {
            Some(state) => f.debug_tuple("LazyState").field(state).finish(),
            None => f.write_str("LazyState(<unparsed>)"),
        }
    }
}
