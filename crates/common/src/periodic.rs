//! Background loops that run a tick on a fixed interval until stopped.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::{
        sync::{Mutex, Notify, RwLock},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

/// One unit of periodic work. A tick must go through the same locks as
/// user-triggered operations before mutating anything.
#[async_trait]
pub trait Tick: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}

/// Handle to a running loop.
pub struct PeriodicTask {
    name: &'static str,
    wake_notify: Arc<Notify>,
    running: Arc<RwLock<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn `task` on the current runtime; the first tick runs immediately.
    pub fn spawn(task: Arc<dyn Tick>, interval: Duration) -> Self {
        let name = task.name();
        let wake_notify = Arc::new(Notify::new());
        let running = Arc::new(RwLock::new(true));

        let notify = Arc::clone(&wake_notify);
        let flag = Arc::clone(&running);
        let handle = tokio::spawn(async move {
            loop {
                if !*flag.read().await {
                    break;
                }
                task.tick().await;
                tokio::select! {
                    () = tokio::time::sleep(interval) => {},
                    () = notify.notified() => {
                        debug!(task = task.name(), "woken early");
                    },
                }
            }
        });
        info!(task = name, interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "periodic task started");

        Self {
            name,
            wake_notify,
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Run the next tick now instead of waiting for the interval.
    pub fn wake(&self) {
        self.wake_notify.notify_one();
    }

    /// Stop after the current tick finishes.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake_notify.notify_one();
        if let Some(handle) = self.handle.lock().await.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(task = self.name, error = %e, "periodic task panicked");
        }
        info!(task = self.name, "periodic task stopped");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Tick for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ticks_until_stopped() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let task = PeriodicTask::spawn(counter.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(40)).await;
        task.stop().await;
        let seen = counter.0.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, got {seen}");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn wake_runs_a_tick_early() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let task = PeriodicTask::spawn(counter.clone(), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        task.wake();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        task.stop().await;
    }
}
