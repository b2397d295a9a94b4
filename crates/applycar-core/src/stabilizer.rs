//! Debounce filter for jittery attributes.
//!
//! A [`DebounceFilter`] observes a source attribute and republishes a value
//! only once it has stayed unchanged for a settle window. Intermediate values
//! are never published. This is mostly useful for discrete signals such as
//! in-position flags, which bounce while a mechanism comes to rest.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::attribute::{Attribute, AttributeListener, ListenerId};
use crate::error::{CoreError, Result};
use crate::notifier::AttributeNotifier;
use crate::scheduler::{Scheduler, TimerHandle};

/// Attribute that only publishes values which have settled.
pub struct DebounceFilter<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    name: String,
    source: Arc<dyn Attribute<T>>,
    scheduler: Arc<dyn Scheduler>,
    notifier: AttributeNotifier<T>,
    state: Mutex<FilterState<T>>,
}

struct FilterState<T> {
    settle_time: Duration,
    last_observed: Option<T>,
    /// `None` until a value settles, and again after each restart
    filtered: Option<T>,
    pending: Option<TimerHandle>,
    /// Bumped on every arm and cancel; a firing timer whose generation no
    /// longer matches has been superseded
    generation: u64,
    subscription: Option<ListenerId>,
}

struct SourceListener<T> {
    shared: Weak<Shared<T>>,
}

impl<T> AttributeListener<T> for SourceListener<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_value_change(&self, values: &[T]) {
        if let (Some(shared), Some(value)) = (self.shared.upgrade(), values.first()) {
            shared.on_value_change(value.clone());
        }
    }

    fn on_validity_change(&self, valid: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.notifier.notify_validity_change(valid);
        }
    }
}

impl<T> DebounceFilter<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Wrap `source`, publishing values that stay unchanged for `settle_time`.
    ///
    /// The source's current value, if any, is taken as already settled.
    pub fn new(
        source: Arc<dyn Attribute<T>>,
        settle_time: Duration,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let initial = source.value();
        let shared = Arc::new(Shared {
            name: source.name().to_string(),
            source: source.clone(),
            scheduler,
            notifier: AttributeNotifier::new(),
            state: Mutex::new(FilterState {
                settle_time,
                last_observed: initial.clone(),
                filtered: initial,
                pending: None,
                generation: 0,
                subscription: None,
            }),
        });

        let listener = Arc::new(SourceListener {
            shared: Arc::downgrade(&shared),
        });
        let id = source.add_listener(listener);
        shared.state.lock().subscription = Some(id);

        Self { shared }
    }

    /// Discard the published value and restart the settle window.
    ///
    /// Used when a new transition is known to be starting, so the previously
    /// settled value can no longer be trusted even though the source has not
    /// changed yet. The last observed value settles again after a full window.
    pub fn restart(&self, settle_time: Duration) -> &Self {
        let mut state = self.shared.state.lock();
        if state.subscription.is_none() {
            debug!("{}: ignoring restart of unbound filter", self.shared.name);
            return self;
        }
        state.filtered = None;
        state.settle_time = settle_time;
        self.shared.arm(&mut state);
        debug!("{}: restarted with settle time {:?}", self.shared.name, settle_time);
        self
    }

    /// Restart with the current settle window.
    pub fn restart_same(&self) -> &Self {
        let settle_time = self.shared.state.lock().settle_time;
        self.restart(settle_time)
    }

    /// Current settle window.
    pub fn settle_time(&self) -> Duration {
        self.shared.state.lock().settle_time
    }

    /// Most recent value seen on the source.
    pub fn last_observed(&self) -> Option<T> {
        self.shared.state.lock().last_observed.clone()
    }

    /// Whether a settle timer is armed.
    pub fn is_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }

    /// Release the source subscription and any pending timer.
    pub fn unbind(&self) {
        let subscription = {
            let mut state = self.shared.state.lock();
            self.shared.disarm(&mut state);
            state.subscription.take()
        };
        if let Some(id) = subscription
            && let Err(e) = self.shared.source.remove_listener(id)
        {
            warn!("{}: failed to remove source listener: {}", self.shared.name, e);
        }
    }
}

impl<T> Shared<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_value_change(self: &Arc<Self>, value: T) {
        let mut state = self.state.lock();
        if state.subscription.is_none() {
            return;
        }
        if state.last_observed.as_ref() != Some(&value) {
            state.last_observed = Some(value);
            self.arm(&mut state);
        }
    }

    fn arm(self: &Arc<Self>, state: &mut FilterState<T>) {
        self.disarm(state);
        let generation = state.generation;
        let weak = Arc::downgrade(self);
        let timer = self.scheduler.schedule(
            state.settle_time,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_settle(generation);
                }
            }),
        );
        state.pending = Some(timer);
    }

    fn disarm(&self, state: &mut FilterState<T>) {
        if let Some(timer) = state.pending.take() {
            timer.cancel();
        }
        state.generation += 1;
    }

    // The last observed value has not changed for a whole settle window.
    //
    // `filtered` is updated inside the delivery round so a listener
    // registering concurrently cannot replay the new value and then receive it
    // again. Lock order is dispatch, then state.
    fn on_settle(&self, generation: u64) {
        self.notifier.update_and_notify(|| {
            let mut state = self.state.lock();
            if state.generation != generation || state.pending.is_none() {
                return None;
            }
            state.pending = None;
            state.filtered = state.last_observed.clone();
            state.filtered.clone()
        });
    }
}

impl<T> Attribute<T> for DebounceFilter<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn value(&self) -> Option<T> {
        self.shared.state.lock().filtered.clone()
    }

    fn is_valid(&self) -> bool {
        self.shared.source.is_valid()
    }

    fn add_listener(&self, listener: Arc<dyn AttributeListener<T>>) -> ListenerId {
        let shared = &self.shared;
        shared
            .notifier
            .add_listener_with_replay(listener, || shared.state.lock().filtered.clone())
    }

    fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.shared.notifier.remove_listener(id)
    }
}

impl<T> DebounceFilter<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Register a listener, failing if the filter has been unbound.
    pub fn try_add_listener(&self, listener: Arc<dyn AttributeListener<T>>) -> Result<ListenerId> {
        if self.shared.state.lock().subscription.is_none() {
            return Err(CoreError::Unbound(self.shared.name.clone()));
        }
        Ok(self.add_listener(listener))
    }
}

impl<T> Drop for DebounceFilter<T> {
    fn drop(&mut self) {
        let subscription = {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.pending.take() {
                timer.cancel();
            }
            state.subscription.take()
        };
        if let Some(id) = subscription {
            let _ = self.shared.source.remove_listener(id);
        }
    }
}
