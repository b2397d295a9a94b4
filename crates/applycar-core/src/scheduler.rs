//! Timer and task execution facility.
//!
//! Components never own threads. Timeouts, settle windows and deferred side
//! effects all go through a [`Scheduler`] supplied by the application, which
//! also owns its lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{CoreError, Result};

/// Unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Facility for one-shot timers and asynchronous execution.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`, unless the returned handle is cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Run `task` soon, on a different call stack than the caller's.
    fn execute(&self, task: Task);
}

/// Handle to a scheduled one-shot task.
///
/// Cancelling is idempotent and safe after the task has already fired. A task
/// that was already running when cancelled is not interrupted.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    /// Create a handle around a shared cancellation flag.
    ///
    /// Scheduler implementations check the flag before running the task.
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self {
            cancelled,
            abort: None,
        }
    }

    fn with_abort(cancelled: Arc<AtomicBool>, abort: AbortHandle) -> Self {
        Self {
            cancelled,
            abort: Some(abort),
        }
    }

    /// Cancel the task.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Scheduler backed by a tokio runtime.
///
/// Timers are spawned tasks sleeping on the runtime clock; `execute` uses the
/// blocking pool because deferred work may perform synchronous channel reads.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Create a scheduler on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a scheduler on the runtime the caller is running in.
    pub fn from_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| CoreError::NoRuntime(e.to_string()))
    }

    /// Shared, type-erased scheduler on the current runtime.
    pub fn shared() -> Result<Arc<dyn Scheduler>> {
        Ok(Arc::new(Self::from_current()?))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });
        TimerHandle::with_abort(cancelled, join.abort_handle())
    }

    fn execute(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let scheduler = TokioScheduler::from_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        let _handle = scheduler.schedule(
            Duration::from_millis(100),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let scheduler = TokioScheduler::from_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        let handle = scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_harmless() {
        let scheduler = TokioScheduler::from_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        let handle = scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_runs_task() {
        let scheduler = TokioScheduler::from_current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        scheduler.execute(Box::new(move || {
            let _ = tx.send(std::thread::current().id());
        }));

        let worker = rx.await.unwrap();
        assert_ne!(worker, std::thread::current().id());
    }

    #[test]
    fn test_from_current_without_runtime() {
        assert!(matches!(
            TokioScheduler::from_current(),
            Err(CoreError::NoRuntime(_))
        ));
    }
}
