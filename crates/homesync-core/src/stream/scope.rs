// ── Event scopes ──
//
// A scope is a child broker hung off the hub broker through one upstream
// subscription. Everything subscribed through the scope goes away together
// when it is closed, which gives one automation a lifetime of its own.

use std::sync::Arc;

use tracing::debug;

use super::broker::{EventBroker, Subscription};
use super::feed::Feed;
use crate::entity::Entity;
use crate::hub::Hub;
use crate::model::{EntityId, Event, StateChange};

pub struct EventScope {
    hub: Hub,
    broker: EventBroker,
    upstream: Option<Subscription>,
}

impl EventScope {
    pub(crate) fn new(hub: Hub) -> Self {
        // Same gate as the hub: a child publish happens inside the parent's.
        let broker = EventBroker::new(Arc::clone(hub.broker().gate()));
        let child = broker.clone();
        let upstream = hub.events().named("scope").subscribe(move |event| {
            child.publish(event);
            Ok(())
        });
        Self {
            hub,
            broker,
            upstream: Some(upstream),
        }
    }

    pub fn events(&self) -> Feed<Arc<Event>> {
        Feed::from_broker(&self.broker, self.hub.feed_context())
    }

    pub fn events_of_type(&self, event_type: impl Into<String>) -> Feed<Arc<Event>> {
        self.events().of_type(event_type)
    }

    pub fn state_all_changes(&self) -> Feed<Arc<StateChange>> {
        self.events().state_all_changes()
    }

    pub fn state_changes(&self) -> Feed<Arc<StateChange>> {
        self.events().state_changes()
    }

    /// Entity handle whose streams are bound to this scope.
    pub fn entity(&self, entity_id: impl Into<EntityId>) -> Entity {
        Entity::new(self.hub.clone(), entity_id.into(), self.events())
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn subscriber_count(&self) -> usize {
        self.broker.subscriber_count()
    }

    pub fn is_closed(&self) -> bool {
        self.upstream.is_none()
    }

    /// Detach from the hub and drop every subscription made through the scope.
    pub fn close(&mut self) {
        if let Some(upstream) = self.upstream.take() {
            upstream.unsubscribe();
            self.broker.clear();
            debug!("event scope closed");
        }
    }
}

impl Drop for EventScope {
    fn drop(&mut self) {
        self.close();
    }
}
