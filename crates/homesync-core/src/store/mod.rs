// ── Caches ──
//
// Per-session views of hub state. Both are rebuilt from scratch on every
// connect and refuse reads until their first load completes.

mod registry_cache;
mod state_cache;

pub use registry_cache::{RegistryCache, RegistrySnapshot};
pub use state_cache::EntityStateCache;
