//! Cancellable one-shot scheduled actions.
//!
//! Used for the software-trigger standby: after an exposure the light source
//! goes back to standby without the triggering caller waiting for it.
//! Scheduling again replaces whatever was pending, and shutdown cancels it.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Holder for at most one pending delayed action.
#[derive(Default)]
pub struct DeferredTask {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, cancelling any action still pending.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        if let Some(previous) = self.pending.lock().replace(handle) {
            if !previous.is_finished() {
                tracing::debug!("Replacing pending deferred action");
            }
            previous.abort();
        }
    }

    /// Cancel the pending action. Returns true if one had not yet finished.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_delay() {
        let task = DeferredTask::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        task.schedule(Duration::from_millis(100), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.is_pending());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!task.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_action() {
        let task = DeferredTask::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        task.schedule(Duration::from_millis(100), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.cancel());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!task.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let task = DeferredTask::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            task.schedule(Duration::from_millis(100), async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
