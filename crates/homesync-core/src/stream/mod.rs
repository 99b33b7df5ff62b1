// ── Event fan-out ──
//
// One hub-side event subscription, multicast to any number of local
// subscribers through the broker. Feeds layer filtering, mapping and
// "with current value" on top; queues bridge to async consumers.

mod broker;
mod feed;
mod filter;
mod queue;
mod scope;

pub use broker::{EventBroker, Handler, Subscription};
pub use feed::Feed;
pub(crate) use feed::FeedContext;
pub use filter::EventFilter;
pub use queue::FeedStream;
pub use scope::EventScope;
