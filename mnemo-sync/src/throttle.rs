//! Leading and trailing edge throttle.
//!
//! The first trigger runs the action immediately. Triggers arriving during
//! the following interval coalesce into one trailing run at the end of it,
//! which opens another interval. Runs are never concurrent and never closer
//! together than the interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub struct Throttle {
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Throttle {
    /// Spawn the throttle task on the current runtime.
    pub fn spawn<F>(interval: Duration, mut action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let signal = Arc::clone(&notify);

        let task = tokio::spawn(async move {
            loop {
                signal.notified().await;
                action();

                loop {
                    tokio::time::sleep(interval).await;
                    if !take_pending(&signal).await {
                        break;
                    }
                    action();
                }
            }
        });

        Self { notify, task }
    }

    /// Request a run.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Cancel pending runs and wait until the action is dropped.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Consume a stored trigger without waiting for a new one.
async fn take_pending(notify: &Notify) -> bool {
    tokio::select! {
        biased;
        _ = notify.notified() => true,
        _ = std::future::ready(()) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(interval_ms: u64) -> (Throttle, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let throttle = Throttle::spawn(Duration::from_millis(interval_ms), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (throttle, runs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_edge_runs_immediately() {
        let (throttle, runs) = counting(1000);
        throttle.trigger();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_leading_and_trailing() {
        let (throttle, runs) = counting(1000);
        for _ in 0..50 {
            throttle.trigger();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_throttle_does_nothing() {
        let (_throttle, runs) = counting(100);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
