// ── Feeds ──
//
// A `Feed<T>` is a recipe for a subscription: a source plus the operators
// layered on top of it. Nothing is registered until `subscribe`,
// `subscribe_async` or `into_stream` is called, and every call creates an
// independent registration on the single shared broker.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use homesync_api::RegistryKind;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

use super::broker::{DispatchGate, EventBroker, Handler, Subscription, deliver, panic_message};
use super::filter::EventFilter;
use super::queue::{FeedStream, SerialQueue, bounded};
use crate::error::{CoreError, HandlerError};
use crate::model::{EntityId, EntityState, Event, StateChange};
use crate::tasks::TaskTracker;

type Source<T> = Arc<dyn Fn(Arc<str>, Handler<T>) -> Subscription + Send + Sync>;

/// Shared plumbing every feed derived from one broker needs.
#[derive(Clone)]
pub(crate) struct FeedContext {
    pub(crate) gate: DispatchGate,
    pub(crate) tracker: TaskTracker,
    pub(crate) capacity: usize,
}

/// Observable sequence of `T`.
pub struct Feed<T> {
    source: Source<T>,
    ctx: FeedContext,
    label: Arc<str>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            ctx: self.ctx.clone(),
            label: Arc::clone(&self.label),
        }
    }
}

impl Feed<Arc<Event>> {
    /// Every event published by `broker`.
    pub(crate) fn from_broker(broker: &EventBroker, ctx: FeedContext) -> Self {
        let broker = broker.clone();
        Self {
            source: Arc::new(move |label, handler| broker.subscribe(label, handler)),
            ctx,
            label: Arc::from("events"),
        }
    }

    /// Only events matching `filter`.
    pub fn matching(&self, filter: EventFilter) -> Self {
        self.filter(move |event| filter.matches(event))
    }

    pub fn of_type(&self, event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        self.named(format!("events({event_type})"))
            .matching(EventFilter::EventType(event_type))
    }

    /// Change notifications of the registry `kind`.
    pub fn registry_updates(&self, kind: RegistryKind) -> Self {
        self.named(format!("registry_updates({kind})"))
            .matching(EventFilter::RegistryUpdated(Some(kind)))
    }

    /// Every state change, including attribute-only ones.
    pub fn state_all_changes(&self) -> Feed<Arc<StateChange>> {
        self.named("state_all_changes")
            .filter_map(|event| event.state_change())
    }

    /// State changes where the primary state value differs.
    pub fn state_changes(&self) -> Feed<Arc<StateChange>> {
        self.state_all_changes()
            .named("state_changes")
            .state_transitions_only()
    }
}

impl Feed<Arc<StateChange>> {
    /// Drop attribute-only changes.
    pub fn state_transitions_only(&self) -> Self {
        self.filter(|change| change.is_state_transition())
    }

    pub fn for_entity(&self, entity_id: &EntityId) -> Self {
        let entity_id = entity_id.clone();
        self.named(format!("{}({entity_id})", self.label))
            .filter(move |change| change.entity_id == entity_id)
    }

    /// Changes after which `predicate` has held on the new state for
    /// `duration` without interruption.
    ///
    /// Only changes that flip the predicate matter: turning it true starts
    /// the wait, turning it false cancels it. The change that started the
    /// wait is the one delivered.
    pub fn when_state_is_for(
        &self,
        predicate: impl Fn(Option<&EntityState>) -> bool + Send + Sync + 'static,
        duration: Duration,
    ) -> Self {
        let source = Arc::clone(&self.source);
        let gate = Arc::clone(&self.ctx.gate);
        let predicate = Arc::new(predicate);
        Self {
            source: Arc::new(move |label: Arc<str>, handler: Handler<Arc<StateChange>>| {
                let pending: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
                let predicate = Arc::clone(&predicate);
                let gate = Arc::clone(&gate);
                let timer = Arc::clone(&pending);
                let timer_label = Arc::clone(&label);
                let upstream = source(
                    label,
                    Arc::new(move |change: &Arc<StateChange>| {
                        let held = predicate(change.new_state().as_deref());
                        if predicate(change.old().as_deref()) == held {
                            return Ok(());
                        }
                        let mut timer = timer.lock();
                        if let Some(previous) = timer.take() {
                            previous.abort();
                        }
                        if held {
                            let change = Arc::clone(change);
                            let handler = Arc::clone(&handler);
                            let gate = Arc::clone(&gate);
                            let label = Arc::clone(&timer_label);
                            *timer = Some(tokio::spawn(async move {
                                tokio::time::sleep(duration).await;
                                let _gate = gate.lock();
                                deliver(&label, "state held", handler.as_ref(), &change);
                            }));
                        }
                        Ok(())
                    }),
                );
                Subscription::new(move || {
                    drop(upstream);
                    if let Some(timer) = pending.lock().take() {
                        timer.abort();
                    }
                })
            }),
            ctx: self.ctx.clone(),
            label: Arc::clone(&self.label),
        }
    }
}

impl<T: 'static> Feed<T> {
    /// Same feed, logged under `label` when a subscriber fails.
    pub fn named(&self, label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        let source = Arc::clone(&self.source);
        let predicate = Arc::new(predicate);
        Self {
            source: Arc::new(move |label, handler: Handler<T>| {
                let predicate = Arc::clone(&predicate);
                source(
                    label,
                    Arc::new(move |item: &T| {
                        if predicate(item) {
                            handler(item)
                        } else {
                            Ok(())
                        }
                    }),
                )
            }),
            ctx: self.ctx.clone(),
            label: Arc::clone(&self.label),
        }
    }

    pub fn filter_map<U: 'static>(
        &self,
        f: impl Fn(&T) -> Option<U> + Send + Sync + 'static,
    ) -> Feed<U> {
        let source = Arc::clone(&self.source);
        let f = Arc::new(f);
        Feed {
            source: Arc::new(move |label, handler: Handler<U>| {
                let f = Arc::clone(&f);
                source(
                    label,
                    Arc::new(move |item: &T| match f(item) {
                        Some(mapped) => handler(&mapped),
                        None => Ok(()),
                    }),
                )
            }),
            ctx: self.ctx.clone(),
            label: Arc::clone(&self.label),
        }
    }

    pub fn map<U: 'static>(&self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> Feed<U> {
        self.filter_map(move |item| Some(f(item)))
    }

    /// Prepend one synthetic item computed at subscribe time.
    ///
    /// Registration and `fetch` run under the dispatch gate, so no live
    /// item can slip in between: the subscriber sees the current value
    /// first and then every later item exactly once. `fetch` returning
    /// `Ok(None)` skips the synthetic item; an error is logged and skips it
    /// too, the live items still flow.
    pub fn with_current(
        &self,
        fetch: impl Fn() -> Result<Option<T>, CoreError> + Send + Sync + 'static,
    ) -> Self {
        let source = Arc::clone(&self.source);
        let gate = Arc::clone(&self.ctx.gate);
        let fetch = Arc::new(fetch);
        Self {
            source: Arc::new(move |label: Arc<str>, handler: Handler<T>| {
                let _gate = gate.lock();
                let subscription = source(Arc::clone(&label), Arc::clone(&handler));
                match fetch() {
                    Ok(Some(current)) => {
                        deliver(&label, "current value", handler.as_ref(), &current);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(subscriber = %label, error = %e, "could not read current value");
                    }
                }
                subscription
            }),
            ctx: self.ctx.clone(),
            label: Arc::clone(&self.label),
        }
    }

    /// Register a synchronous handler, run on the dispatch path.
    pub fn subscribe(
        &self,
        handler: impl Fn(&T) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Subscription {
        (self.source)(Arc::clone(&self.label), Arc::new(handler))
    }

    /// Register an async handler that sees items one at a time, in order.
    ///
    /// Items wait in a bounded per-subscription backlog drained by a single
    /// tracked worker, so dispatch never waits on the handler.
    pub fn subscribe_async<F, Fut, E>(&self, handler: F) -> Subscription
    where
        T: Clone + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<HandlerError> + Send + 'static,
    {
        let tracker = self.ctx.tracker.clone();
        let label = Arc::clone(&self.label);
        let queue = Arc::new(SerialQueue::new(Arc::clone(&label), self.ctx.capacity));
        let handler = Arc::new(handler);
        self.subscribe(move |item| {
            if queue.push(item.clone()) {
                tracker.track(
                    format!("async subscriber of {label}"),
                    drain(Arc::clone(&queue), Arc::clone(&handler), Arc::clone(&label)),
                );
            }
            Ok(())
        })
    }

    /// Register an async handler. Each invocation runs as its own tracked
    /// task, so invocations may overlap and finish out of order.
    pub fn subscribe_async_concurrent<F, Fut, E>(&self, handler: F) -> Subscription
    where
        T: Clone + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<HandlerError> + Send + 'static,
    {
        let tracker = self.ctx.tracker.clone();
        let label = Arc::clone(&self.label);
        self.subscribe(move |item| {
            tracker.track(format!("async subscriber of {label}"), handler(item.clone()));
            Ok(())
        })
    }

    /// Consume the feed as an async stream backed by a bounded queue.
    pub fn into_stream(self) -> FeedStream<T>
    where
        T: Clone + Send,
    {
        let (tx, rx) = bounded(Arc::clone(&self.label), self.ctx.capacity);
        let subscription = self.subscribe(move |item| {
            tx.offer(item.clone());
            Ok(())
        });
        FeedStream::new(rx, subscription)
    }
}

/// Worker of a serial async subscriber. A failing or panicking item is
/// logged and the next one still runs.
async fn drain<T, F, Fut, E>(
    queue: Arc<SerialQueue<T>>,
    handler: Arc<F>,
    label: Arc<str>,
) -> Result<(), HandlerError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Into<HandlerError>,
{
    while let Some(item) = queue.next() {
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(item))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(panic) => Err(panic),
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let e: HandlerError = e.into();
                error!(subscriber = %label, error = %e, "async subscriber failed");
            }
            Err(panic) => {
                error!(
                    subscriber = %label,
                    panic = panic_message(panic.as_ref()),
                    "async subscriber panicked"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::EntityState;
    use parking_lot::{Mutex, ReentrantMutex};
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn setup() -> (EventBroker, Feed<Arc<Event>>) {
        let gate: DispatchGate = Arc::new(ReentrantMutex::new(()));
        let broker = EventBroker::new(Arc::clone(&gate));
        let ctx = FeedContext {
            gate,
            tracker: TaskTracker::new(),
            capacity: 16,
        };
        let feed = Feed::from_broker(&broker, ctx);
        (broker, feed)
    }

    fn state(entity_id: &str, value: &str, brightness: u32) -> serde_json::Value {
        json!({
            "entity_id": entity_id,
            "state": value,
            "attributes": {"brightness": brightness}
        })
    }

    fn state_changed(entity_id: &str, old: &serde_json::Value, new: &serde_json::Value) -> Arc<Event> {
        let data = json!({"entity_id": entity_id, "old_state": old, "new_state": new});
        Arc::new(Event::new(
            homesync_api::STATE_CHANGED,
            serde_json::value::to_raw_value(&data).unwrap(),
            None,
            None,
            None,
        ))
    }

    fn plain(event_type: &str) -> Arc<Event> {
        Arc::new(Event::new(
            event_type,
            serde_json::value::to_raw_value(&json!({})).unwrap(),
            None,
            None,
            None,
        ))
    }

    #[test]
    fn attribute_only_change_reaches_all_changes_but_not_changes() {
        let (broker, events) = setup();
        let all = Arc::new(Mutex::new(0));
        let transitions = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&all);
        let _all = events.state_all_changes().subscribe(move |_| {
            *counter.lock() += 1;
            Ok(())
        });
        let counter = Arc::clone(&transitions);
        let _changes = events.state_changes().subscribe(move |_| {
            *counter.lock() += 1;
            Ok(())
        });

        broker.publish(&state_changed(
            "light.kitchen",
            &state("light.kitchen", "on", 10),
            &state("light.kitchen", "on", 20),
        ));
        assert_eq!(*all.lock(), 1);
        assert_eq!(*transitions.lock(), 0);

        broker.publish(&state_changed(
            "light.kitchen",
            &state("light.kitchen", "on", 20),
            &state("light.kitchen", "off", 20),
        ));
        assert_eq!(*all.lock(), 2);
        assert_eq!(*transitions.lock(), 1);
    }

    #[test]
    fn with_current_delivers_synthetic_first() {
        let (broker, events) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let kitchen = EntityId::from("light.kitchen");

        let current: EntityState = serde_json::from_value(state("light.kitchen", "off", 0)).unwrap();
        let current = Arc::new(current);
        let id = kitchen.clone();
        let feed = events
            .state_all_changes()
            .for_entity(&kitchen)
            .with_current(move || {
                Ok(Some(Arc::new(StateChange::current(
                    id.clone(),
                    Some(Arc::clone(&current)),
                ))))
            });

        let sink = Arc::clone(&seen);
        let _sub = feed.subscribe(move |change| {
            sink.lock().push((change.old_value(), change.new_value()));
            Ok(())
        });
        broker.publish(&state_changed(
            "light.kitchen",
            &state("light.kitchen", "off", 0),
            &state("light.kitchen", "on", 0),
        ));

        assert_eq!(
            *seen.lock(),
            vec![
                (None, Some("off".to_owned())),
                (Some("off".to_owned()), Some("on".to_owned())),
            ]
        );
    }

    #[test]
    fn with_current_holds_off_concurrent_publish() {
        let (broker, events) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // A publish racing with subscription must land strictly after the
        // synthetic item, never before it and never lost.
        let racing = broker.clone();
        let feed = events.with_current(move || {
            let racer = racing.clone();
            let handle = std::thread::spawn(move || racer.publish(&plain("live")));
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!handle.is_finished());
            drop(handle);
            Ok(Some(plain("current")))
        });

        let sink = Arc::clone(&seen);
        let _sub = feed.subscribe(move |event| {
            sink.lock().push(event.event_type.clone());
            Ok(())
        });

        for _ in 0..200 {
            if seen.lock().len() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), vec!["current", "live"]);
    }

    #[test]
    fn subscriber_error_does_not_affect_others() {
        let (broker, events) = setup();
        let count = Arc::new(Mutex::new(0));

        let _bad = events.of_type("ping").subscribe(|_| Err("handler bug".into()));
        let counter = Arc::clone(&count);
        let _good = events.of_type("ping").subscribe(move |_| {
            *counter.lock() += 1;
            Ok(())
        });

        broker.publish(&plain("ping"));
        broker.publish(&plain("other"));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn map_and_filter_compose() {
        let (broker, events) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = events
            .map(|event| event.event_type.len())
            .filter(|len| *len > 3)
            .subscribe(move |len| {
                sink.lock().push(*len);
                Ok(())
            });

        broker.publish(&plain("abc"));
        broker.publish(&plain("abcdef"));
        assert_eq!(*seen.lock(), vec![6]);
    }

    #[tokio::test]
    async fn into_stream_yields_in_order_and_unsubscribes_on_drop() {
        let (broker, events) = setup();
        let mut stream = events.of_type("tick").into_stream();
        assert_eq!(broker.subscriber_count(), 1);

        broker.publish(&plain("tick"));
        broker.publish(&plain("tock"));
        broker.publish(&plain("tick"));

        assert_eq!(stream.next().await.unwrap().event_type, "tick");
        assert_eq!(stream.next().await.unwrap().event_type, "tick");

        drop(stream);
        assert_eq!(broker.subscriber_count(), 0);
    }

    fn tracked() -> (EventBroker, Feed<Arc<Event>>, TaskTracker) {
        let gate: DispatchGate = Arc::new(ReentrantMutex::new(()));
        let broker = EventBroker::new(Arc::clone(&gate));
        let tracker = TaskTracker::new();
        let events = Feed::from_broker(
            &broker,
            FeedContext {
                gate,
                tracker: tracker.clone(),
                capacity: 16,
            },
        );
        (broker, events, tracker)
    }

    /// Handler that takes longer for the first event than for the second.
    fn slow_first(
        seen: &Arc<Mutex<Vec<String>>>,
    ) -> impl Fn(Arc<Event>) -> futures_util::future::BoxFuture<'static, Result<(), HandlerError>>
    + Send
    + Sync
    + 'static {
        let seen = Arc::clone(seen);
        move |event: Arc<Event>| {
            let sink = Arc::clone(&seen);
            Box::pin(async move {
                if event.event_type == "first" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                sink.lock().push(event.event_type.clone());
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_async_keeps_order() {
        let (broker, events, tracker) = tracked();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = events.subscribe_async(slow_first(&seen));

        broker.publish(&plain("first"));
        broker.publish(&plain("second"));
        assert_eq!(tracker.shutdown(Duration::from_secs(1)).await, 0);
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_async_survives_a_failing_item() {
        let (broker, events, tracker) = tracked();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = events.subscribe_async(move |event: Arc<Event>| {
            let sink = Arc::clone(&sink);
            async move {
                if event.event_type == "bad" {
                    return Err(HandlerError::from("rejected"));
                }
                sink.lock().push(event.event_type.clone());
                Ok(())
            }
        });

        broker.publish(&plain("bad"));
        broker.publish(&plain("good"));
        assert_eq!(tracker.shutdown(Duration::from_secs(1)).await, 0);
        assert_eq!(*seen.lock(), vec!["good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_async_concurrent_overlaps() {
        let (broker, events, tracker) = tracked();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = events.subscribe_async_concurrent(slow_first(&seen));

        broker.publish(&plain("first"));
        broker.publish(&plain("second"));
        assert_eq!(tracker.shutdown(Duration::from_secs(1)).await, 0);
        assert_eq!(*seen.lock(), vec!["second", "first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn when_state_is_for_waits_out_interruptions() {
        let (broker, events) = setup();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let _sub = events
            .state_all_changes()
            .when_state_is_for(
                |s: Option<&EntityState>| s.is_some_and(EntityState::is_on),
                Duration::from_secs(60),
            )
            .subscribe(move |change| {
                sink.lock().push(change.new_value());
                Ok(())
            });

        let off = state("light.hall", "off", 0);
        let on = state("light.hall", "on", 100);
        let dimmed = state("light.hall", "on", 40);

        broker.publish(&state_changed("light.hall", &off, &on));
        tokio::time::sleep(Duration::from_secs(30)).await;
        broker.publish(&state_changed("light.hall", &on, &off));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(fired.lock().is_empty());

        broker.publish(&state_changed("light.hall", &off, &on));
        tokio::time::sleep(Duration::from_secs(59)).await;
        // Still on, so the wait keeps running.
        broker.publish(&state_changed("light.hall", &on, &dimmed));
        assert!(fired.lock().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fired.lock(), vec![Some("on".to_owned())]);
    }

    #[tokio::test(start_paused = true)]
    async fn when_state_is_for_stops_on_unsubscribe() {
        let (broker, events) = setup();
        let fired = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&fired);
        let sub = events
            .state_all_changes()
            .when_state_is_for(
                |s: Option<&EntityState>| s.is_some_and(EntityState::is_on),
                Duration::from_secs(10),
            )
            .subscribe(move |_| {
                *sink.lock() += 1;
                Ok(())
            });

        let off = state("light.hall", "off", 0);
        let on = state("light.hall", "on", 100);
        broker.publish(&state_changed("light.hall", &off, &on));
        drop(sub);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*fired.lock(), 0);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
