// ── Event broker ──
//
// Multicasts hub events to local subscribers. The subscriber list is an
// immutable snapshot swapped on subscribe/unsubscribe, so `publish` walks a
// stable list even when handlers (un)subscribe while it runs. Every handler
// call is its own failure boundary: errors and panics are logged and the
// next subscriber still gets the event.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::ReentrantMutex;
use tracing::error;

use crate::error::HandlerError;
use crate::model::Event;

/// Subscriber callback. Returning `Err` is logged, never propagated.
pub type Handler<T> = Arc<dyn Fn(&T) -> Result<(), HandlerError> + Send + Sync>;

/// Serializes publishing with "subscribe and read the current value".
/// Reentrant so handlers may subscribe from inside a delivery.
pub(crate) type DispatchGate = Arc<ReentrantMutex<()>>;

// ── Subscription ─────────────────────────────────────────────────────

/// Handle to one registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// End the subscription now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the registration alive for as long as its source lives.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ── EventBroker ──────────────────────────────────────────────────────

struct Subscriber {
    id: u64,
    label: Arc<str>,
    handler: Handler<Arc<Event>>,
    active: AtomicBool,
}

struct BrokerInner {
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    gate: DispatchGate,
}

/// Fan-out point for one event source. Cheap to clone.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    pub(crate) fn new(gate: DispatchGate) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: ArcSwap::from_pointee(Vec::new()),
                next_id: AtomicU64::new(0),
                gate,
            }),
        }
    }

    pub(crate) fn gate(&self) -> &DispatchGate {
        &self.inner.gate
    }

    pub fn subscribe(&self, label: Arc<str>, handler: Handler<Arc<Event>>) -> Subscription {
        let subscriber = Arc::new(Subscriber {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            label,
            handler,
            active: AtomicBool::new(true),
        });
        self.inner.subscribers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&subscriber));
            next
        });

        let broker = Arc::downgrade(&self.inner);
        let id = subscriber.id;
        Subscription::new(move || {
            subscriber.active.store(false, Ordering::Release);
            remove_subscriber(&broker, id);
        })
    }

    /// Deliver `event` to every active subscriber, in registration order.
    pub fn publish(&self, event: &Arc<Event>) {
        let _gate = self.inner.gate.lock();
        let subscribers = self.inner.subscribers.load();
        for subscriber in subscribers.iter() {
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            deliver(
                &subscriber.label,
                &event.event_type,
                subscriber.handler.as_ref(),
                event,
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load().len()
    }

    /// Drop every subscriber at once.
    pub(crate) fn clear(&self) {
        let previous = self.inner.subscribers.swap(Arc::new(Vec::new()));
        for subscriber in previous.iter() {
            subscriber.active.store(false, Ordering::Release);
        }
    }
}

fn remove_subscriber(broker: &Weak<BrokerInner>, id: u64) {
    if let Some(inner) = broker.upgrade() {
        inner.subscribers.rcu(|current| {
            current
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

/// Run one handler inside its own failure boundary.
///
/// Returns `false` when the handler failed or panicked (already logged).
pub(crate) fn deliver<T: ?Sized>(
    subscriber: &str,
    what: &str,
    handler: &(dyn Fn(&T) -> Result<(), HandlerError> + Send + Sync),
    item: &T,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(item))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(subscriber, event = what, error = %e, "subscriber failed handling event");
            false
        }
        Err(panic) => {
            error!(
                subscriber,
                event = what,
                panic = panic_message(panic.as_ref()),
                "subscriber panicked handling event"
            );
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn broker() -> EventBroker {
        EventBroker::new(Arc::new(ReentrantMutex::new(())))
    }

    fn event(event_type: &str) -> Arc<Event> {
        Arc::new(Event::new(
            event_type,
            serde_json::value::to_raw_value(&serde_json::json!({})).unwrap(),
            None,
            None,
            None,
        ))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Handler<Arc<Event>> {
        let log = Arc::clone(log);
        Arc::new(move |event: &Arc<Event>| -> Result<(), HandlerError> {
            log.lock().push(format!("{name}:{}", event.event_type));
            Ok(())
        })
    }

    #[test]
    fn delivers_in_registration_order() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = broker.subscribe("a".into(), recorder(&log, "a"));
        let _b = broker.subscribe("b".into(), recorder(&log, "b"));

        broker.publish(&event("ping"));
        assert_eq!(*log.lock(), vec!["a:ping", "b:ping"]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = broker.subscribe("a".into(), recorder(&log, "a"));
        let _b = broker.subscribe("b".into(), recorder(&log, "b"));
        assert_eq!(broker.subscriber_count(), 2);

        a.unsubscribe();
        broker.publish(&event("ping"));
        assert_eq!(*log.lock(), vec!["b:ping"]);
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[test]
    fn unsubscribe_during_publish_skips_remaining_delivery() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let slot = Arc::clone(&victim);
        let _killer = broker.subscribe(
            "killer".into(),
            Arc::new(move |_: &Arc<Event>| -> Result<(), HandlerError> {
                slot.lock().take();
                Ok(())
            }),
        );
        *victim.lock() = Some(broker.subscribe("victim".into(), recorder(&log, "victim")));

        broker.publish(&event("ping"));
        assert!(log.lock().is_empty());
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _bad = broker.subscribe("bad".into(), Arc::new(|_: &Arc<Event>| -> Result<(), HandlerError> {
            Err("nope".into())
        }));
        let _panicky = broker.subscribe(
            "panicky".into(),
            Arc::new(|_: &Arc<Event>| -> Result<(), HandlerError> { panic!("boom") }),
        );
        let _good = broker.subscribe("good".into(), recorder(&log, "good"));

        broker.publish(&event("ping"));
        broker.publish(&event("pong"));
        assert_eq!(*log.lock(), vec!["good:ping", "good:pong"]);
    }

    #[test]
    fn handlers_may_subscribe_reentrantly() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let nested: Arc<Mutex<Vec<Subscription>>> = Arc::default();

        let inner_broker = broker.clone();
        let inner_log = Arc::clone(&log);
        let store = Arc::clone(&nested);
        let _outer = broker.subscribe(
            "outer".into(),
            Arc::new(move |_: &Arc<Event>| -> Result<(), HandlerError> {
                let _gate = inner_broker.gate().lock();
                let sub = inner_broker.subscribe("inner".into(), recorder(&inner_log, "inner"));
                store.lock().push(sub);
                Ok(())
            }),
        );

        broker.publish(&event("first"));
        assert!(log.lock().is_empty());
        broker.publish(&event("second"));
        assert_eq!(*log.lock(), vec!["inner:second"]);
    }

    #[test]
    fn clear_deactivates_everyone() {
        let broker = broker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = broker.subscribe("a".into(), recorder(&log, "a"));
        broker.clear();
        broker.publish(&event("ping"));
        assert!(log.lock().is_empty());
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
