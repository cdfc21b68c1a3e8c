//! Counted task spawning.
//!
//! Every background task the supervisor starts (pumps, waiters, timers,
//! group fan-out) goes through a [`Tasks`] handle so leaks show up as a
//! non-draining live count instead of silent runtime growth. Owned by the
//! manager and cloned into processes; there is no global tracker.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Counts {
    live: AtomicUsize,
    live_blocking: AtomicUsize,
    started: AtomicUsize,
}

/// Snapshot of tracker counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub live: usize,
    pub live_blocking: usize,
    pub started: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Tasks {
    counts: Arc<Counts>,
}

struct Live {
    counter: Arc<Counts>,
    blocking: bool,
}

impl Drop for Live {
    fn drop(&mut self) {
        let c = if self.blocking {
            &self.counter.live_blocking
        } else {
            &self.counter.live
        };
        c.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            live: self.counts.live.load(Ordering::SeqCst),
            live_blocking: self.counts.live_blocking.load(Ordering::SeqCst),
            started: self.counts.started.load(Ordering::SeqCst),
        }
    }

    /// Spawns a tracked tokio task. The live count drops on completion,
    /// panic, or cancellation.
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.counts.started.fetch_add(1, Ordering::SeqCst);
        self.counts.live.fetch_add(1, Ordering::SeqCst);
        let live = Live {
            counter: Arc::clone(&self.counts),
            blocking: false,
        };
        tokio::spawn(async move {
            let _live = live;
            fut.await
        })
    }

    /// Spawns a tracked task on the blocking pool.
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.counts.started.fetch_add(1, Ordering::SeqCst);
        self.counts.live_blocking.fetch_add(1, Ordering::SeqCst);
        let live = Live {
            counter: Arc::clone(&self.counts),
            blocking: true,
        };
        tokio::task::spawn_blocking(move || {
            let _live = live;
            f()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_drain_after_completion() {
        let tasks = Tasks::new();
        let h = tasks.spawn(async { 7 });
        assert_eq!(h.await.unwrap(), 7);
        let b = tasks.spawn_blocking(|| 8);
        assert_eq!(b.await.unwrap(), 8);
        // Guards drop on task exit; yield once to let the runtime finish.
        tokio::task::yield_now().await;
        let stats = tasks.stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.live_blocking, 0);
    }
}
