// ── Bounded delivery queues ──
//
// Bridge synchronous dispatch to async consumers. Dispatch never waits on
// a slow consumer: past 90% fill a warning is logged, and once a queue is
// full further items are dropped with an error.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

use super::broker::Subscription;

/// Producer half, called from the dispatch path.
pub(crate) struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    label: Arc<str>,
    capacity: usize,
    warn_at: usize,
    under_pressure: AtomicBool,
}

impl<T> QueueSender<T> {
    /// Enqueue without blocking. A closed queue is not an error: the
    /// consumer simply went away.
    pub(crate) fn offer(&self, item: T) {
        match self.tx.try_send(item) {
            Ok(()) => {
                let queued = self.capacity - self.tx.capacity();
                if queued >= self.warn_at {
                    if !self.under_pressure.swap(true, Ordering::Relaxed) {
                        warn!(
                            stream = %self.label,
                            queued,
                            capacity = self.capacity,
                            "stream queue above 90% capacity, consumer is falling behind"
                        );
                    }
                } else {
                    self.under_pressure.store(false, Ordering::Relaxed);
                }
            }
            Err(TrySendError::Full(_)) => {
                error!(
                    stream = %self.label,
                    capacity = self.capacity,
                    "stream queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

pub(crate) fn bounded<T>(label: Arc<str>, capacity: usize) -> (QueueSender<T>, ReceiverStream<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let warn_at = (capacity * 9).div_ceil(10);
    let sender = QueueSender {
        tx,
        label,
        capacity,
        warn_at,
        under_pressure: AtomicBool::new(false),
    };
    (sender, ReceiverStream::new(rx))
}

// ── FeedStream ───────────────────────────────────────────────────────

/// Async stream over a feed. Dropping it ends the underlying subscription.
pub struct FeedStream<T> {
    inner: ReceiverStream<T>,
    _subscription: Subscription,
}

impl<T> FeedStream<T> {
    pub(crate) fn new(inner: ReceiverStream<T>, subscription: Subscription) -> Self {
        Self {
            inner,
            _subscription: subscription,
        }
    }
}

impl<T> Stream for FeedStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // ReceiverStream is Unpin, so pinning through `&mut` is fine.
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ── SerialQueue ──────────────────────────────────────────────────────

/// Backlog of one serial async subscriber.
///
/// At most one worker drains it at a time, and only while items are
/// waiting: `push` reports when a worker has to be started, `next` retires
/// the worker once the backlog is empty. Both decisions happen under the
/// same lock, so no item is ever left behind without a worker.
pub(crate) struct SerialQueue<T> {
    label: Arc<str>,
    capacity: usize,
    state: Mutex<SerialState<T>>,
}

struct SerialState<T> {
    items: VecDeque<T>,
    running: bool,
}

impl<T> SerialQueue<T> {
    pub(crate) fn new(label: Arc<str>, capacity: usize) -> Self {
        Self {
            label,
            capacity: capacity.max(1),
            state: Mutex::new(SerialState {
                items: VecDeque::new(),
                running: false,
            }),
        }
    }

    /// Queue `item`. Returns `true` when the caller must start a worker.
    pub(crate) fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            error!(
                stream = %self.label,
                capacity = self.capacity,
                "async subscriber backlog full, dropping event"
            );
            return false;
        }
        state.items.push_back(item);
        !std::mem::replace(&mut state.running, true)
    }

    /// Next item for the worker. `None` means the worker must stop.
    pub(crate) fn next(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if item.is_none() {
            state.running = false;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn keeps_order_and_drops_when_full() {
        let (tx, mut rx) = bounded::<u32>("test".into(), 4);
        for value in 0..6 {
            tx.offer(value);
        }
        drop(tx);

        let received: Vec<u32> = (&mut rx).collect().await;
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_consumer_is_ignored() {
        let (tx, rx) = bounded::<u32>("test".into(), 4);
        drop(rx);
        tx.offer(1);
    }

    #[test]
    fn serial_queue_asks_for_one_worker_at_a_time() {
        let queue = SerialQueue::new("test".into(), 2);
        assert!(queue.push(1));
        assert!(!queue.push(2));
        assert!(!queue.push(3));

        assert_eq!(queue.next(), Some(1));
        assert_eq!(queue.next(), Some(2));
        assert_eq!(queue.next(), None);
        // The worker retired, so the next item needs a fresh one.
        assert!(queue.push(4));
    }
}
