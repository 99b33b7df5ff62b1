// ── Throttle after first event ──
//
// Rate limiter for bursty notifications. The first value is acted on
// immediately; anything arriving within `min_delay` of the last acted-on
// value is held back until the interval ends, and a newer value replaces a
// held one (coalescing, not queuing).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Action<T> = Box<dyn Fn(T) + Send + Sync>;

pub struct Throttle<T> {
    inner: Arc<ThrottleInner<T>>,
}

struct ThrottleInner<T> {
    min_delay: Duration,
    action: Action<T>,
    cancel: CancellationToken,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    hold_off_until: Option<Instant>,
    pending: Option<JoinHandle<()>>,
    /// Bumped on every push; a scheduled fire only runs if still current.
    generation: u64,
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new(
        min_delay: Duration,
        cancel: CancellationToken,
        action: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                min_delay,
                action: Box::new(action),
                cancel,
                state: Mutex::new(ThrottleState::default()),
            }),
        }
    }

    /// Offer a value. Must be called from within a tokio runtime.
    pub fn push(&self, value: T) {
        if self.inner.cancel.is_cancelled() {
            return;
        }

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.generation += 1;

        let hold_off_until = state.hold_off_until;
        match hold_off_until {
            Some(until) if until >= now => {
                let generation = state.generation;
                let inner = Arc::clone(&self.inner);
                state.pending = Some(tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        () = inner.cancel.cancelled() => {}
                        () = tokio::time::sleep_until(until) => inner.fire_scheduled(generation, value),
                    }
                }));
            }
            _ => {
                state.hold_off_until = Some(now + self.inner.min_delay);
                drop(state);
                (self.inner.action)(value);
            }
        }
    }

    /// `true` while a held-back value waits for the interval to end.
    pub fn has_pending(&self) -> bool {
        self.inner
            .state
            .lock()
            .pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<T> ThrottleInner<T> {
    fn fire_scheduled(&self, generation: u64, value: T) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.pending = None;
            state.hold_off_until = Some(Instant::now() + self.min_delay);
        }
        (self.action)(value);
    }
}

impl<T> Drop for Throttle<T> {
    fn drop(&mut self) {
        if let Some(pending) = self.inner.state.lock().pending.take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    type Fired = Arc<Mutex<Vec<(u32, Duration)>>>;

    fn recording(min_delay: Duration) -> (Throttle<u32>, Fired, CancellationToken) {
        let fired: Fired = Arc::default();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let sink = Arc::clone(&fired);
        let throttle = Throttle::new(min_delay, cancel.clone(), move |value| {
            sink.lock().push((value, start.elapsed()));
        });
        (throttle, fired, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_fires_first_then_last() {
        let five_minutes = Duration::from_secs(300);
        let (throttle, fired, _cancel) = recording(five_minutes);

        throttle.push(1);
        tokio::time::advance(Duration::from_millis(10)).await;
        throttle.push(2);
        tokio::time::advance(Duration::from_millis(10)).await;
        throttle.push(3);

        assert_eq!(*fired.lock(), vec![(1, Duration::ZERO)]);
        assert!(throttle.has_pending());

        tokio::time::sleep(five_minutes).await;
        tokio::task::yield_now().await;

        assert_eq!(*fired.lock(), vec![(1, Duration::ZERO), (3, five_minutes)]);
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_resets_hold_off() {
        let delay = Duration::from_secs(1);
        let (throttle, fired, _cancel) = recording(delay);

        throttle.push(1);
        tokio::time::advance(Duration::from_secs(2)).await;
        throttle.push(2);

        let values: Vec<u32> = fired.lock().iter().map(|(v, _)| *v).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_pending_value() {
        let delay = Duration::from_secs(60);
        let (throttle, fired, cancel) = recording(delay);

        throttle.push(1);
        throttle.push(2);
        cancel.cancel();

        tokio::time::sleep(delay * 2).await;
        tokio::task::yield_now().await;

        let values: Vec<u32> = fired.lock().iter().map(|(v, _)| *v).collect();
        assert_eq!(values, vec![1]);
    }
}
