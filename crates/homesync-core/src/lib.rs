//! Caching and event-dispatch core between a hub connection and automation code.
//!
//! - **[`Hub`]**: Central facade owning one live session at a time.
//!   [`connect()`](Hub::connect) subscribes to the hub's event stream, loads
//!   the state and registry snapshots, then spawns the dispatch loop and the
//!   command processor. Subscriptions made on the hub survive reconnects.
//!
//! - **[`EntityStateCache`]**: Latest state per entity, kept current by the
//!   dispatch loop. New state payloads stay unparsed until someone reads them.
//!
//! - **[`RegistryCache`]**: Entities, devices, areas, floors and labels plus
//!   derived join indices, swapped atomically as a whole on every reload.
//!   Reloads are throttled per registry.
//!
//! - **[`Feed<T>`]**: Observable sequence vended by the hub, a scope or an
//!   [`Entity`]. Supports filtering, mapping, "with current value", sync and
//!   async handlers, and conversion into a bounded async stream.
//!
//! - **[`TaskTracker`]**: Fire-and-forget background work with a bounded
//!   drain at shutdown.
//!
//! - **[`Command`]**: Writes routed through an `mpsc` channel to the
//!   session's command processor. Reads never touch the channel.

pub mod command;
pub mod config;
pub mod convert;
pub mod entity;
pub mod error;
pub mod hub;
pub mod model;
pub mod store;
pub mod stream;
pub mod tasks;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{Command, CommandResult};
pub use config::HubConfig;
pub use entity::{Entity, NumericEntity};
pub use error::{CoreError, HandlerError};
pub use hub::{ConnectionState, Hub};
pub use store::{EntityStateCache, RegistryCache, RegistrySnapshot};
pub use stream::{EventFilter, EventScope, Feed, FeedStream, Subscription};
pub use tasks::{TaskTracker, Throttle};

pub use model::{
    Area, Context, Device, EntityId, EntityRegistration, EntityState, Event, Floor, Label,
    LazyState, StateChange, TypedState,
};
