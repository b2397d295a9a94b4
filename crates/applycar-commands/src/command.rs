//! Command completion handles.
//!
//! A [`CommandMonitor`] is handed to the caller of `post()` and resolved
//! exactly once, to success or to a [`CommandError`].

use std::future::Future;
use std::sync::Arc;

use applycar_core::TimestampProvider;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::CommandError;

/// Unique command identifier.
pub type CommandId = Uuid;

/// Coarse command status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    /// Posted, not yet resolved
    Active,
    /// Resolved successfully
    Succeeded,
    /// Resolved with an error
    Failed,
}

impl CommandStatus {
    /// Check if the command has been resolved.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Active)
    }
}

/// Final result of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub result: Result<(), CommandError>,
    pub completed_at: DateTime<Utc>,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Callback notified when a command resolves.
pub trait CommandListener: Send + Sync {
    fn on_success(&self);
    fn on_failure(&self, error: &CommandError);
}

/// Write-once completion handle for a posted command.
///
/// Cloning yields another handle to the same command.
#[derive(Clone)]
pub struct CommandMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    id: CommandId,
    posted_at: DateTime<Utc>,
    clock: Arc<dyn TimestampProvider>,
    outcome: watch::Sender<Option<CommandOutcome>>,
    listeners: Mutex<Vec<Arc<dyn CommandListener>>>,
}

impl CommandMonitor {
    /// Create an unresolved monitor, stamped with the clock's current time.
    pub fn new(clock: Arc<dyn TimestampProvider>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(MonitorInner {
                id: Uuid::new_v4(),
                posted_at: clock.now(),
                clock,
                outcome,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> CommandId {
        self.inner.id
    }

    pub fn posted_at(&self) -> DateTime<Utc> {
        self.inner.posted_at
    }

    pub fn status(&self) -> CommandStatus {
        match &*self.inner.outcome.borrow() {
            None => CommandStatus::Active,
            Some(o) if o.is_success() => CommandStatus::Succeeded,
            Some(_) => CommandStatus::Failed,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// The outcome, once resolved.
    pub fn outcome(&self) -> Option<CommandOutcome> {
        (*self.inner.outcome.borrow()).clone()
    }

    /// The failure, if the command resolved with one.
    pub fn error(&self) -> Option<CommandError> {
        self.outcome().and_then(|o| o.result.err())
    }

    /// Resolve successfully. Returns `false` if already resolved.
    pub fn complete_success(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Resolve with an error. Returns `false` if already resolved.
    pub fn complete_failure(&self, error: CommandError) -> bool {
        self.complete(Err(error))
    }

    fn complete(&self, result: Result<(), CommandError>) -> bool {
        let outcome = CommandOutcome {
            result,
            completed_at: self.inner.clock.now(),
        };
        let mut slot = Some(outcome.clone());
        let resolved = self.inner.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = slot.take();
                true
            } else {
                false
            }
        });
        if !resolved {
            return false;
        }

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners {
            notify(listener.as_ref(), &outcome.result);
        }
        true
    }

    /// Attach a listener. If the command is already resolved the listener is
    /// called immediately on the caller's thread.
    pub fn set_callback(&self, listener: Arc<dyn CommandListener>) {
        let mut listeners = self.inner.listeners.lock();
        let resolved = self.outcome();
        match resolved {
            Some(outcome) => {
                drop(listeners);
                notify(listener.as_ref(), &outcome.result);
            }
            None => listeners.push(listener),
        }
    }

    /// Wait for the command to resolve.
    pub async fn wait(&self) -> Result<(), CommandError> {
        let mut rx = self.inner.outcome.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => {
                let current: &Option<CommandOutcome> = &outcome;
                current.as_ref().map(|o| o.result.clone())
            }
            Err(_) => None,
        };
        result.unwrap_or(Err(CommandError::Interrupted))
    }

    /// Wait for the command to resolve, giving up if `interrupt` completes first.
    ///
    /// Giving up does not affect the command itself.
    pub async fn wait_until<F>(&self, interrupt: F) -> Result<(), CommandError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.wait() => result,
            _ = interrupt => Err(CommandError::Interrupted),
        }
    }

    /// Block the current thread until the command resolves.
    ///
    /// Must not be called from within an async runtime worker.
    pub fn wait_blocking(&self) -> Result<(), CommandError> {
        futures::executor::block_on(self.wait())
    }
}

impl std::fmt::Debug for CommandMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandMonitor")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

fn notify(listener: &dyn CommandListener, result: &Result<(), CommandError>) {
    match result {
        Ok(()) => listener.on_success(),
        Err(e) => listener.on_failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use applycar_core::SystemClock;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl CommandListener for Recorder {
        fn on_success(&self) {
            self.calls.lock().push("success".to_string());
        }

        fn on_failure(&self, error: &CommandError) {
            self.calls.lock().push(format!("failure:{}", error.kind()));
        }
    }

    fn monitor() -> CommandMonitor {
        CommandMonitor::new(Arc::new(SystemClock))
    }

    #[test]
    fn test_monitor_new() {
        let m = monitor();
        assert_eq!(m.status(), CommandStatus::Active);
        assert!(!m.is_done());
        assert!(m.outcome().is_none());
    }

    #[test]
    fn test_monitor_is_write_once() {
        let m = monitor();
        assert!(m.complete_failure(CommandError::Timeout));
        assert!(!m.complete_success());
        assert!(!m.complete_failure(CommandError::InProgress));

        assert_eq!(m.status(), CommandStatus::Failed);
        assert_eq!(m.error(), Some(CommandError::Timeout));
        assert!(m.outcome().unwrap().completed_at >= m.posted_at());
    }

    #[test]
    fn test_callback_before_and_after_completion() {
        let m = monitor();
        let early = Arc::new(Recorder::default());
        m.set_callback(early.clone());
        m.complete_success();

        let late = Arc::new(Recorder::default());
        m.set_callback(late.clone());

        assert_eq!(*early.calls.lock(), vec!["success"]);
        assert_eq!(*late.calls.lock(), vec!["success"]);
    }

    #[tokio::test]
    async fn test_wait_resolves() {
        let m = monitor();
        let resolver = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            resolver.complete_failure(CommandError::CarError {
                message: Some("limit".to_string()),
            });
        });

        let result = m.wait().await;
        assert!(matches!(result, Err(CommandError::CarError { .. })));
    }

    #[tokio::test]
    async fn test_wait_until_interrupted_leaves_command_active() {
        let m = monitor();
        let result = m
            .wait_until(tokio::time::sleep(Duration::from_millis(5)))
            .await;

        assert_eq!(result, Err(CommandError::Interrupted));
        assert_eq!(m.status(), CommandStatus::Active);
    }

    #[test]
    fn test_wait_blocking() {
        let m = monitor();
        let resolver = m.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            resolver.complete_success();
        });

        assert_eq!(m.wait_blocking(), Ok(()));
        handle.join().unwrap();
    }
}
