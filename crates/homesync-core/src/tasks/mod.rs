// ── Background work ──
//
// Tracked fire-and-forget tasks and the burst throttle that schedules
// registry reloads.

mod throttle;
mod tracker;

pub use throttle::Throttle;
pub use tracker::TaskTracker;
