use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Counts live background tasks (watchdog, signal listener, log followers) so
/// shutdown can wait for stragglers and leaks show up in the numbers.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    active: Arc<AtomicUsize>,
    spawned_total: Arc<AtomicUsize>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of tasks that are alive (running or pending).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Total number of tasks ever spawned via this tracker.
    pub fn total_spawned(&self) -> usize {
        self.spawned_total.load(Ordering::SeqCst)
    }

    /// Spawn a Tokio task and track its lifetime using an RAII guard.
    ///
    /// When the task ends (normal completion, panic, or cancellation), the guard is
    /// dropped and `active_count()` is decremented.
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawned_total.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let guard = TaskGuard {
            counter: Arc::clone(&self.active),
        };

        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Poll until every tracked task has finished or `timeout` elapses.
    /// Returns the number of tasks still active.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.active_count()
    }
}

#[derive(Debug)]
pub struct TaskGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_follow_task_lifetimes() {
        let t = TaskTracker::new();
        assert_eq!(t.active_count(), 0);

        let h1 = t.spawn(async { 1 + 1 });
        let h2 = t.spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(t.total_spawned(), 2);

        assert_eq!(h1.await.unwrap(), 2);
        h2.await.unwrap();
        assert_eq!(t.drain(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn guard_drops_on_panic() {
        let t = TaskTracker::new();
        let h = t.spawn(async { panic!("boom") });
        assert!(h.await.is_err());
        assert_eq!(t.drain(Duration::from_secs(1)).await, 0);
    }
}
