//! Finalization that survives early returns and dropped futures.

use futures::future::BoxFuture;

type Finalizer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Runs an async finalizer unless explicitly disarmed.
///
/// The normal path awaits [`FinalizeGuard::finalize`]. If the guard is
/// dropped while still armed (the owning future was cancelled, or a
/// panic unwound through it) the finalizer is spawned on the current
/// tokio runtime instead.
pub struct FinalizeGuard {
    label: &'static str,
    finalizer: Option<Finalizer>,
}

impl FinalizeGuard {
    /// Arms a guard around `finalizer`.
    #[must_use]
    pub fn new<F>(label: &'static str, finalizer: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            label,
            finalizer: Some(Box::new(finalizer)),
        }
    }

    /// Runs the finalizer now. Later calls and the drop are no-ops.
    pub async fn finalize(mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer().await;
        }
    }

    /// Drops the finalizer without running it.
    pub fn disarm(mut self) {
        self.finalizer = None;
    }

    /// Returns true while the finalizer is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.finalizer.is_some()
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(guard = self.label, "finalizing from drop");
                handle.spawn(finalizer());
            }
            Err(_) => {
                tracing::error!(guard = self.label, "dropped outside a runtime; finalizer skipped");
            }
        }
    }
}

impl std::fmt::Debug for FinalizeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizeGuard")
            .field("label", &self.label)
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_guard(counter: &Arc<AtomicUsize>) -> FinalizeGuard {
        let counter = counter.clone();
        FinalizeGuard::new("test", move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_finalize_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        counting_guard(&counter).finalize().await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disarm_skips_finalizer() {
        let counter = Arc::new(AtomicUsize::new(0));
        counting_guard(&counter).disarm();
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_spawns_finalizer() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _guard = counting_guard(&counter);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_future_still_finalizes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = counting_guard(&counter);
        let work = async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(10)).await;
        };

        assert!(tokio::time::timeout(Duration::from_millis(10), work).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
