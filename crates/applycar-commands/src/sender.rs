//! Apply/CAR command sender.
//!
//! A [`CommandSender`] binds one Apply record and one CAR record. Posting a
//! command writes `START` to the Apply record and returns a [`CommandMonitor`]
//! that resolves once the CAR record acknowledges the command, reports an
//! error, or the configured timeout expires.
//!
//! The sender owns no threads. It reacts to point notifications on whatever
//! thread the transport delivers them, and uses the application's
//! [`Scheduler`] for its timeout timer and for resolving monitors off the
//! notification call stack. Transport I/O is never performed while the sender
//! lock is held.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use applycar_core::config::{self, defaults};
use applycar_core::{ListenerId, Scheduler, SystemClock, TimerHandle, TimestampProvider, value_listener};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::command::{CommandId, CommandListener, CommandMonitor};
use crate::error::{CommandError, TransportError};
use crate::events::{TransitionBus, TransitionEvent, TransitionTrigger};
use crate::point::{ApplyPoint, CarPoint, CarState, Directive};
use crate::protocol::{ProtocolState, Resolution, Step};

/// Command sender configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderConfig {
    /// Sender name, used in logs and transition events
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Command timeout in milliseconds (0 disables the timeout)
    pub timeout_ms: u64,
    /// Log every state transition at debug level
    pub trace: bool,
}

impl SenderConfig {
    /// Configuration with the given name and environment defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Command timeout; zero means no timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            name: "applycar".to_string(),
            description: String::new(),
            timeout_ms: config::command_timeout_ms(),
            trace: config::trace_enabled(),
        }
    }
}

/// Sends commands through an Apply/CAR record pair.
pub struct CommandSender<S: CarState> {
    shared: Arc<Shared<S>>,
}

struct Shared<S: CarState> {
    name: String,
    description: String,
    trace: bool,
    apply: Arc<dyn ApplyPoint>,
    car: Arc<dyn CarPoint<S>>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn TimestampProvider>,
    transitions: TransitionBus,
    inner: Mutex<Inner<S>>,
}

struct Inner<S> {
    state: ProtocolState<S>,
    /// Monitor of the command in flight
    monitor: Option<CommandMonitor>,
    timer: Option<TimerHandle>,
    /// Bumped on every post and on unbind; timers and post continuations
    /// carrying an older value are stale
    sequence: u64,
    timeout: Duration,
    bound: bool,
    subscriptions: Option<Subscriptions>,
}

#[derive(Debug, Clone, Copy)]
struct Subscriptions {
    apply_value: ListenerId,
    car_clid: ListenerId,
    car_state: ListenerId,
}

impl<S: CarState> CommandSender<S> {
    /// Bind a sender to an Apply/CAR pair, timestamping with the system clock.
    pub fn new(
        config: SenderConfig,
        apply: Arc<dyn ApplyPoint>,
        car: Arc<dyn CarPoint<S>>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, CommandError> {
        Self::with_clock(config, apply, car, scheduler, Arc::new(SystemClock))
    }

    /// Bind a sender to an Apply/CAR pair.
    ///
    /// Fails if any of the point subscriptions cannot be established; the
    /// subscriptions made so far are removed again.
    pub fn with_clock(
        config: SenderConfig,
        apply: Arc<dyn ApplyPoint>,
        car: Arc<dyn CarPoint<S>>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn TimestampProvider>,
    ) -> Result<Self, CommandError> {
        let timeout = config.timeout();
        let shared = Arc::new(Shared {
            name: config.name,
            description: config.description,
            trace: config.trace,
            apply,
            car,
            scheduler,
            clock,
            transitions: TransitionBus::new(defaults::TRANSITION_CHANNEL_CAPACITY),
            inner: Mutex::new(Inner {
                state: ProtocolState::Idle,
                monitor: None,
                timer: None,
                sequence: 0,
                timeout,
                bound: true,
                subscriptions: None,
            }),
        });

        let subscriptions = Shared::subscribe(&shared)?;
        shared.inner.lock().subscriptions = Some(subscriptions);

        info!(
            "Command sender {} bound to {} and {}",
            shared.name,
            shared.apply.name(),
            shared.car.name()
        );
        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn description(&self) -> &str {
        &self.shared.description
    }

    /// Channel name of the Apply record.
    pub fn apply_name(&self) -> &str {
        self.shared.apply.name()
    }

    /// Channel name of the CAR record.
    pub fn car_name(&self) -> &str {
        self.shared.car.name()
    }

    /// Post a command.
    ///
    /// Never waits for the command to complete. If a command is already in
    /// flight the returned monitor is resolved with
    /// [`CommandError::InProgress`] and nothing is written.
    pub fn post(&self) -> CommandMonitor {
        Shared::post(&self.shared)
    }

    /// Post a command and wait for it to resolve.
    pub async fn post_wait(&self) -> CommandMonitor {
        let monitor = self.post();
        // The outcome stays readable on the monitor
        let _ = monitor.wait().await;
        monitor
    }

    /// Post a command and wait for it to resolve, unless `interrupt` completes
    /// first.
    ///
    /// An interrupted wait returns [`CommandError::Interrupted`] and leaves the
    /// command running.
    pub async fn post_wait_until<F>(&self, interrupt: F) -> Result<CommandMonitor, CommandError>
    where
        F: Future<Output = ()>,
    {
        let monitor = self.post();
        match monitor.wait_until(interrupt).await {
            Err(CommandError::Interrupted) if !monitor.is_done() => {
                Err(CommandError::Interrupted)
            }
            _ => Ok(monitor),
        }
    }

    /// Post a command, notifying `listener` when it resolves.
    pub fn post_callback(&self, listener: Arc<dyn CommandListener>) -> CommandMonitor {
        let monitor = self.post();
        monitor.set_callback(listener);
        monitor
    }

    /// Write `CLEAR` to the Apply record. Failures are logged and ignored.
    pub fn clear(&self) {
        if let Err(e) = self.shared.apply.write_directive(Directive::Clear) {
            warn!("Failed to clear {}: {}", self.shared.apply.name(), e);
        }
    }

    /// Set the timeout for subsequent commands; zero disables it.
    ///
    /// A command already posted keeps the timeout it was posted with.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.inner.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.shared.inner.lock().timeout
    }

    /// Whether a command is in flight.
    pub fn is_active(&self) -> bool {
        !self.shared.inner.lock().state.is_idle()
    }

    /// Snapshot of the protocol state.
    pub fn state(&self) -> ProtocolState<S> {
        self.shared.inner.lock().state.clone()
    }

    /// Whether the sender still accepts commands.
    pub fn is_bound(&self) -> bool {
        self.shared.inner.lock().bound
    }

    /// Subscribe to state transitions.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TransitionEvent> {
        self.shared.transitions.subscribe()
    }

    /// The most recent `limit` transitions, oldest first.
    pub fn recent_transitions(&self, limit: usize) -> Vec<TransitionEvent> {
        self.shared.transitions.recent(limit)
    }

    /// Release the points.
    ///
    /// A command in flight is resolved with [`CommandError::Unbound`], and so
    /// is every later post. Calling this more than once is harmless.
    pub fn unbind(&self) {
        self.shared.unbind();
    }
}

impl<S: CarState> Drop for CommandSender<S> {
    fn drop(&mut self) {
        self.shared.unbind();
    }
}

impl<S: CarState> std::fmt::Debug for CommandSender<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender")
            .field("name", &self.shared.name)
            .field("apply", &self.shared.apply.name())
            .field("car", &self.shared.car.name())
            .field("state", &self.shared.inner.lock().state)
            .finish()
    }
}

/// Outcome of the locked part of `post`.
enum Reservation {
    Rejected(CommandError),
    /// Sequence number and timeout of the reserved command
    Reserved(u64, Duration),
}

impl<S: CarState> Shared<S> {
    fn subscribe(this: &Arc<Self>) -> Result<Subscriptions, CommandError> {
        let weak = Arc::downgrade(this);
        let apply_value = this
            .apply
            .add_value_listener(value_listener(move |values: &[i32]| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), values.first()) {
                    shared.on_apply_value(*value);
                }
            }))?;

        let weak = Arc::downgrade(this);
        let car_clid = match this
            .car
            .add_clid_listener(value_listener(move |values: &[i32]| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), values.first()) {
                    shared.on_car_clid(*value);
                }
            })) {
            Ok(id) => id,
            Err(e) => {
                this.remove_quietly("apply value", this.apply.remove_value_listener(apply_value));
                return Err(e.into());
            }
        };

        let weak: Weak<Self> = Arc::downgrade(this);
        let car_state = match this
            .car
            .add_state_listener(value_listener(move |values: &[S]| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), values.first()) {
                    shared.on_car_state(value.clone());
                }
            })) {
            Ok(id) => id,
            Err(e) => {
                this.remove_quietly("apply value", this.apply.remove_value_listener(apply_value));
                this.remove_quietly("CAR clid", this.car.remove_clid_listener(car_clid));
                return Err(e.into());
            }
        };

        Ok(Subscriptions {
            apply_value,
            car_clid,
            car_state,
        })
    }

    fn post(this: &Arc<Self>) -> CommandMonitor {
        let monitor = CommandMonitor::new(this.clock.clone());

        let reservation = {
            let mut inner = this.inner.lock();
            if !inner.bound {
                Reservation::Rejected(CommandError::Unbound(this.name.clone()))
            } else if !inner.state.is_idle() {
                Reservation::Rejected(CommandError::InProgress)
            } else {
                inner.sequence = inner.sequence.wrapping_add(1);
                inner.monitor = Some(monitor.clone());
                this.transition_locked(&mut inner, TransitionTrigger::Post, |_| Step {
                    next: ProtocolState::preset(None),
                    resolution: None,
                });
                Reservation::Reserved(inner.sequence, inner.timeout)
            }
        };

        let (sequence, timeout) = match reservation {
            Reservation::Reserved(sequence, timeout) => (sequence, timeout),
            Reservation::Rejected(error) => {
                debug!("Command sender {} rejected post: {}", this.name, error);
                monitor.complete_failure(error);
                return monitor;
            }
        };

        // Baseline for the correlation check
        let baseline = match this.car.state() {
            Ok(state) => state,
            Err(e) => {
                this.abort_post(sequence, e);
                return monitor;
            }
        };
        {
            let mut inner = this.inner.lock();
            if inner.sequence == sequence {
                this.transition_locked(&mut inner, TransitionTrigger::Baseline, |state| {
                    state.with_baseline(baseline)
                });
            }
        }

        if let Err(e) = this.apply.write_directive(Directive::Start) {
            this.abort_post(sequence, e);
            return monitor;
        }

        let mut inner = this.inner.lock();
        if inner.sequence == sequence && !inner.state.is_idle() && !timeout.is_zero() {
            let weak = Arc::downgrade(this);
            let handle = this.scheduler.schedule(
                timeout,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_timeout(sequence);
                    }
                }),
            );
            if let Some(previous) = inner.timer.replace(handle) {
                previous.cancel();
            }
        }
        drop(inner);

        monitor
    }

    fn abort_post(&self, sequence: u64, error: TransportError) {
        warn!("Command sender {} failed to post: {}", self.name, error);
        let pending = {
            let mut inner = self.inner.lock();
            if inner.sequence != sequence || inner.state.is_idle() {
                None
            } else {
                self.transition_locked(&mut inner, TransitionTrigger::TransportFailure, |_| Step {
                    next: ProtocolState::Idle,
                    resolution: Some(Resolution::Fail(error.into())),
                })
            }
        };
        if let Some((monitor, resolution)) = pending {
            self.resolve(monitor, resolution);
        }
    }

    fn on_apply_value(self: &Arc<Self>, value: i32) {
        let apply = self.apply.name();
        self.handle(TransitionTrigger::ApplyValue(value), |state| {
            state.on_apply_value(value, apply)
        });
    }

    fn on_car_clid(self: &Arc<Self>, clid: i32) {
        self.handle(TransitionTrigger::CarClid(clid), |state| state.on_car_clid(clid));
    }

    fn on_car_state(self: &Arc<Self>, state: S) {
        self.handle(TransitionTrigger::CarState(format!("{:?}", state)), |current| {
            current.on_car_state(state)
        });
    }

    fn on_timeout(self: &Arc<Self>, sequence: u64) {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.sequence != sequence {
                return;
            }
            self.transition_locked(&mut inner, TransitionTrigger::Timeout, ProtocolState::on_timeout)
        };
        if let Some((monitor, resolution)) = pending {
            self.resolve_deferred(monitor, resolution);
        }
    }

    fn handle<F>(self: &Arc<Self>, trigger: TransitionTrigger, event: F)
    where
        F: FnOnce(ProtocolState<S>) -> Step<S>,
    {
        let pending = {
            let mut inner = self.inner.lock();
            self.transition_locked(&mut inner, trigger, event)
        };
        if let Some((monitor, resolution)) = pending {
            self.resolve_deferred(monitor, resolution);
        }
    }

    /// Apply one transition. Returns the monitor to resolve, if the
    /// transition resolved the command in flight.
    fn transition_locked<F>(
        &self,
        inner: &mut Inner<S>,
        trigger: TransitionTrigger,
        event: F,
    ) -> Option<(CommandMonitor, Resolution)>
    where
        F: FnOnce(ProtocolState<S>) -> Step<S>,
    {
        let from = std::mem::replace(&mut inner.state, ProtocolState::Idle);
        let was_idle = from.is_idle();
        let before = from.to_string();

        let Step { next, resolution } = event(from);

        // Notifications while idle are not transitions
        if !(was_idle && next.is_idle()) || resolution.is_some() {
            let after = next.to_string();
            if self.trace {
                debug!("{}: {} -> {} on {:?}", self.name, before, after, trigger);
            }
            let command_id: Option<CommandId> = inner.monitor.as_ref().map(CommandMonitor::id);
            self.transitions.publish(TransitionEvent::new(
                self.name.clone(),
                command_id,
                trigger,
                before,
                after,
                self.clock.now(),
            ));
        }

        inner.state = next;
        if inner.state.is_idle()
            && let Some(timer) = inner.timer.take()
        {
            timer.cancel();
        }

        let resolution = resolution?;
        let monitor = inner.monitor.take()?;
        Some((monitor, resolution))
    }

    /// Resolve a monitor on the scheduler.
    fn resolve_deferred(self: &Arc<Self>, monitor: CommandMonitor, resolution: Resolution) {
        let shared = self.clone();
        self.scheduler
            .execute(Box::new(move || shared.resolve(monitor, resolution)));
    }

    /// Resolve a monitor on the current thread, reading remote error
    /// messages if needed.
    fn resolve(&self, monitor: CommandMonitor, resolution: Resolution) {
        match resolution {
            Resolution::Succeed => {
                debug!("Command {} on {} succeeded", monitor.id(), self.name);
                monitor.complete_success();
            }
            Resolution::FailWithApplyMessage => {
                let message = read_message(self.apply.name(), self.apply.message());
                monitor.complete_failure(CommandError::ApplyRejected { message });
            }
            Resolution::FailWithCarMessage => {
                let message = read_message(self.car.name(), self.car.message());
                monitor.complete_failure(CommandError::CarError { message });
            }
            Resolution::Fail(error) => {
                debug!("Command {} on {} failed: {}", monitor.id(), self.name, error);
                monitor.complete_failure(error);
            }
        }
    }

    fn unbind(&self) {
        let (subscriptions, pending) = {
            let mut inner = self.inner.lock();
            if !inner.bound {
                return;
            }
            inner.bound = false;
            inner.sequence = inner.sequence.wrapping_add(1);
            let pending = if inner.state.is_idle() {
                None
            } else {
                let error = CommandError::Unbound(self.name.clone());
                self.transition_locked(&mut inner, TransitionTrigger::Unbind, |_| Step {
                    next: ProtocolState::Idle,
                    resolution: Some(Resolution::Fail(error)),
                })
            };
            (inner.subscriptions.take(), pending)
        };

        if let Some((monitor, resolution)) = pending {
            self.resolve(monitor, resolution);
        }

        if let Some(subs) = subscriptions {
            self.remove_quietly("apply value", self.apply.remove_value_listener(subs.apply_value));
            self.remove_quietly("CAR clid", self.car.remove_clid_listener(subs.car_clid));
            self.remove_quietly("CAR state", self.car.remove_state_listener(subs.car_state));
        }
        self.apply.unbind();
        self.car.unbind();
        info!("Command sender {} unbound", self.name);
    }

    fn remove_quietly(&self, what: &str, result: Result<(), TransportError>) {
        if let Err(e) = result {
            warn!("Command sender {} failed to remove {} listener: {}", self.name, what, e);
        }
    }
}

/// Error message text, or `None` when it is blank or cannot be read.
fn read_message(channel: &str, result: Result<String, TransportError>) -> Option<String> {
    match result {
        Ok(message) if message.trim().is_empty() => None,
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Failed to read error message from {}: {}", channel, e);
            None
        }
    }
}
