// ── Background task tracking ──
//
// Fire-and-forget work spawned from the event path (async subscriber
// callbacks, registry reloads, service calls) is registered here so
// shutdown can drain it with a bounded wait instead of abandoning it
// silently or hanging forever.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use crate::error::{CoreError, HandlerError};

/// Registry of in-flight background tasks. Cheap to clone.
#[derive(Clone, Default)]
pub struct TaskTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    tasks: DashMap<u64, String>,
    next_id: AtomicU64,
    drained: Notify,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` on the runtime and track it until it finishes.
    ///
    /// Failures and panics are logged with `description`, never propagated.
    /// Cancellation (an aborted task or a [`CoreError::Cancelled`] result) is
    /// logged at trace level only.
    pub fn track<F, E>(&self, description: impl Into<String>, future: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<HandlerError> + Send + 'static,
    {
        let description = description.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.tasks.insert(id, description.clone());

        let inner = Arc::clone(&self.inner);
        let work = tokio::spawn(future);
        tokio::spawn(async move {
            match work.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let e: HandlerError = e.into();
                    if is_cancellation(e.as_ref()) {
                        trace!(description = %description, "background task cancelled");
                    } else {
                        error!(description = %description, error = %e, "background task failed");
                    }
                }
                Err(join) if join.is_cancelled() => {
                    trace!(description = %description, "background task cancelled");
                }
                Err(join) => {
                    error!(description = %description, error = %join, "background task panicked");
                }
            }
            inner.tasks.remove(&id);
            if inner.tasks.is_empty() {
                inner.drained.notify_waiters();
            }
        });
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    /// Descriptions of every task still running.
    pub fn outstanding(&self) -> Vec<String> {
        self.inner
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Wait until no tracked task is left or `timeout` elapses.
    ///
    /// Tasks registered while waiting are waited for too. Returns how many
    /// tasks were abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.tasks.is_empty() {
                return 0;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let outstanding = self.outstanding();
                if outstanding.is_empty() {
                    return 0;
                }
                warn!(
                    count = outstanding.len(),
                    tasks = ?outstanding,
                    "abandoning background tasks at shutdown"
                );
                return outstanding.len();
            }
        }
    }
}

fn is_cancellation(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    matches!(err.downcast_ref::<CoreError>(), Some(CoreError::Cancelled))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_running_tasks() {
        let tracker = TaskTracker::new();
        let done = Arc::new(AtomicU64::new(0));

        let flag = Arc::clone(&done);
        tracker.track("slow reload", async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(1, Ordering::SeqCst);
            Ok::<_, CoreError>(())
        });
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.shutdown(Duration::from_secs(5)).await, 0);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_added_during_shutdown_are_drained() {
        let tracker = TaskTracker::new();
        let done = Arc::new(AtomicU64::new(0));

        let nested = tracker.clone();
        let flag = Arc::clone(&done);
        tracker.track("outer", async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            nested.track("inner", async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(1, Ordering::SeqCst);
                Ok::<_, CoreError>(())
            });
            Ok::<_, CoreError>(())
        });

        assert_eq!(tracker.shutdown(Duration::from_secs(5)).await, 0);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_after_timeout() {
        let tracker = TaskTracker::new();
        tracker.track("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, CoreError>(())
        });

        let started = Instant::now();
        assert_eq!(tracker.shutdown(Duration::from_secs(5)).await, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(tracker.outstanding(), vec!["stuck".to_owned()]);
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let tracker = TaskTracker::new();
        tracker.track("failing", async {
            Err::<(), _>(CoreError::Internal("boom".into()))
        });
        tracker.track("cancelled", async { Err::<(), _>(CoreError::Cancelled) });
        tracker.track("panicking", async {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, CoreError>(())
        });

        assert_eq!(tracker.shutdown(Duration::from_secs(5)).await, 0);
        assert!(tracker.is_empty());
    }
}
