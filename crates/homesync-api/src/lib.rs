// homesync-api: Connection boundary between a hub session and homesync-core.

pub mod connection;
pub mod error;
pub mod memory;
pub mod types;

pub use connection::{EventStream, HubConnection};
pub use error::Error;
pub use memory::{FailPoint, MemoryConnection};
pub use types::{
    RawArea, RawContext, RawDevice, RawEntityEntry, RawEntityState, RawEvent, RawFloor, RawLabel,
    RegistryKind, STATE_CHANGED, ServiceCall, ServiceTarget,
};
