use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A re-armable one-shot timer running on a tokio runtime.
///
/// Every [`arm`](Self::arm) bumps a generation that is handed to the callback. A callback that
/// fires after the timer was cancelled or re-armed sees a stale generation, and its owner should
/// treat it as a no-op (see [`is_current`](Self::is_current)).
#[derive(Debug)]
pub struct IdleTimer {
    runtime: Handle,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl IdleTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            generation: 0,
            pending: None,
        }
    }

    /// Cancel any pending firing and schedule `on_fire` after `after`.
    pub fn arm<F>(&mut self, after: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;

        self.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            on_fire(generation);
        }));
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a firing with `generation` is the latest one armed and not cancelled.
    pub fn is_current(&self, generation: u64) -> bool {
        self.pending.is_some() && self.generation == generation
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut timer = IdleTimer::new(Handle::current());

        let seen = Arc::clone(&fired);
        let generation = timer.arm(Duration::from_secs(5), move |g| {
            seen.store(g, Ordering::SeqCst)
        });
        assert!(timer.is_current(generation));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_supersedes_previous() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut timer = IdleTimer::new(Handle::current());

        let seen = Arc::clone(&fired);
        let first = timer.arm(Duration::from_secs(5), move |g| {
            seen.fetch_add(g, Ordering::SeqCst);
        });
        let seen = Arc::clone(&fired);
        let second = timer.arm(Duration::from_secs(10), move |g| {
            seen.fetch_add(g * 100, Ordering::SeqCst);
        });
        assert!(!timer.is_current(first));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), second * 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut timer = IdleTimer::new(Handle::current());

        let seen = Arc::clone(&fired);
        let generation = timer.arm(Duration::from_secs(1), move |g| {
            seen.store(g, Ordering::SeqCst)
        });
        timer.cancel();
        assert!(!timer.is_current(generation));
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
