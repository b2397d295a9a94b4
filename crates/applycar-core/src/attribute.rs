//! Observable attributes.
//!
//! An attribute is a named value that changes over time and can be observed.
//! Channels deliver values as arrays, so listeners receive a slice; most
//! consumers only look at the first element.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::notifier::AttributeNotifier;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate a fresh, process-unique id.
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Receiver of attribute change notifications.
pub trait AttributeListener<T>: Send + Sync {
    /// Called with the new values of the attribute.
    fn on_value_change(&self, values: &[T]);

    /// Called when the attribute becomes valid or invalid.
    fn on_validity_change(&self, _valid: bool) {}
}

/// An observable, named value.
pub trait Attribute<T>: Send + Sync {
    /// Attribute name.
    fn name(&self) -> &str;

    /// Current value, if known.
    fn value(&self) -> Option<T>;

    /// Current value as a (possibly empty) list.
    fn values(&self) -> Vec<T> {
        self.value().into_iter().collect()
    }

    /// Whether the underlying channel is currently valid.
    fn is_valid(&self) -> bool;

    /// Register a listener.
    fn add_listener(&self, listener: Arc<dyn AttributeListener<T>>) -> ListenerId;

    /// Remove a previously registered listener.
    fn remove_listener(&self, id: ListenerId) -> Result<()>;
}

struct FnListener<F> {
    f: F,
}

impl<T, F> AttributeListener<T> for FnListener<F>
where
    F: Fn(&[T]) + Send + Sync,
{
    fn on_value_change(&self, values: &[T]) {
        (self.f)(values);
    }
}

/// Wrap a closure as a listener that only cares about value changes.
pub fn value_listener<T, F>(f: F) -> Arc<dyn AttributeListener<T>>
where
    T: 'static,
    F: Fn(&[T]) + Send + Sync + 'static,
{
    Arc::new(FnListener { f })
}

/// In-process attribute whose value is set directly.
///
/// Useful as the source of a [`DebounceFilter`](crate::DebounceFilter) when the
/// signal is produced locally, and for driving filters in tests.
pub struct MemoryAttribute<T> {
    name: String,
    state: RwLock<MemoryState<T>>,
    notifier: AttributeNotifier<T>,
}

struct MemoryState<T> {
    value: Option<T>,
    valid: bool,
}

impl<T: Clone + Send + Sync + 'static> MemoryAttribute<T> {
    /// Create an attribute with no value.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState {
                value: None,
                valid: true,
            }),
            notifier: AttributeNotifier::new(),
        }
    }

    /// Create an attribute holding an initial value.
    pub fn with_value(name: impl Into<String>, value: T) -> Self {
        let attr = Self::new(name);
        attr.state.write().value = Some(value);
        attr
    }

    /// Set a new value and notify listeners.
    pub fn set(&self, value: T) {
        self.state.write().value = Some(value.clone());
        self.notifier.notify_value_change(&[value]);
    }

    /// Change validity and notify listeners.
    pub fn set_valid(&self, valid: bool) {
        self.state.write().valid = valid;
        self.notifier.notify_validity_change(valid);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.notifier.listener_count()
    }
}

impl<T: Clone + Send + Sync + 'static> Attribute<T> for MemoryAttribute<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Option<T> {
        self.state.read().value.clone()
    }

    fn is_valid(&self) -> bool {
        self.state.read().valid
    }

    fn add_listener(&self, listener: Arc<dyn AttributeListener<T>>) -> ListenerId {
        self.notifier.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.notifier.remove_listener(id)
    }
}
