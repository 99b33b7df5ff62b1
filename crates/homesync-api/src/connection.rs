//! The contract between the core and whatever actually talks to the hub.
//!
//! A [`HubConnection`] is one authenticated session. The core never opens
//! sockets itself: it asks the connection for snapshots, subscribes to the
//! live event stream, and forwards commands. When the session dies the
//! event stream ends and every further call fails with
//! [`Error::ConnectionClosed`].

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::Error;
use crate::types::{RawEntityState, RawEvent, RegistryKind, ServiceCall};

/// Live event stream of one session. Ends when the session closes.
pub type EventStream = BoxStream<'static, RawEvent>;

/// One session with the hub.
///
/// Object safe so the core can hold it as `Arc<dyn HubConnection>`.
pub trait HubConnection: Send + Sync + 'static {
    /// Full state snapshot of every entity.
    fn fetch_states(&self) -> BoxFuture<'_, Result<Vec<RawEntityState>, Error>>;

    /// Raw listing of one registry. Records are decoded by the caller so a
    /// single malformed entry does not poison the whole listing.
    fn fetch_registry(&self, kind: RegistryKind) -> BoxFuture<'_, Result<Vec<Value>, Error>>;

    /// Subscribe to every event the hub fires.
    fn subscribe_events(&self) -> BoxFuture<'_, Result<EventStream, Error>>;

    /// Invoke a service. Returns the service response when one was asked for.
    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, Result<Option<Value>, Error>>;

    /// Fire a custom event on the hub bus.
    fn fire_event(
        &self,
        event_type: String,
        data: Option<Value>,
    ) -> BoxFuture<'_, Result<(), Error>>;
}
