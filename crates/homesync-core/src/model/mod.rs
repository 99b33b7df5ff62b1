// ── Domain model ──
//
// Canonical representation of what the hub reports. Wire records from
// `homesync_api` are converted into these types in `crate::convert`.

pub mod entity_id;
pub mod event;
pub mod registry;
pub mod state;

pub use entity_id::EntityId;
pub use event::{Event, StateChange};
pub use registry::{Area, Device, EntityRegistration, Floor, Label};
pub use state::{Context, EntityState, LazyState, TypedState};
