//! Attribute change fan-out.
//!
//! The notifier decouples producers of attribute changes from the set of
//! listeners interested in them. Deliveries are serialised so every listener
//! observes notifications in the order they were issued, and a replay issued
//! while registering a listener is always ordered before later publications.

use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};

use crate::attribute::{AttributeListener, ListenerId};
use crate::error::{CoreError, Result};

/// Dispatcher of value and validity changes to a dynamic listener set.
pub struct AttributeNotifier<T> {
    /// Registered listeners, in registration order
    listeners: RwLock<Vec<(ListenerId, Arc<dyn AttributeListener<T>>)>>,
    /// Held for the duration of each delivery round
    dispatch: ReentrantMutex<()>,
}

impl<T> AttributeNotifier<T> {
    /// Create a notifier with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            dispatch: ReentrantMutex::new(()),
        }
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn AttributeListener<T>>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.write().push((id, listener));
        id
    }

    /// Register a listener and immediately replay the current value to it.
    ///
    /// `current` is evaluated while deliveries are held off, so a publication
    /// racing with the registration reaches the new listener after the replay.
    pub fn add_listener_with_replay<F>(
        &self,
        listener: Arc<dyn AttributeListener<T>>,
        current: F,
    ) -> ListenerId
    where
        F: FnOnce() -> Option<T>,
    {
        let _guard = self.dispatch.lock();
        let id = self.add_listener(listener.clone());
        if let Some(value) = current() {
            listener.on_value_change(std::slice::from_ref(&value));
        }
        id
    }

    /// Remove a listener.
    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        if listeners.len() == before {
            Err(CoreError::ListenerNotFound(id))
        } else {
            Ok(())
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether any listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Notify every listener of new values.
    pub fn notify_value_change(&self, values: &[T]) {
        let _guard = self.dispatch.lock();
        for listener in self.snapshot() {
            listener.on_value_change(values);
        }
    }

    /// Notify one listener of new values, if it is still registered.
    pub fn notify_value_change_single(&self, id: ListenerId, values: &[T]) {
        let _guard = self.dispatch.lock();
        let listener = self
            .listeners
            .read()
            .iter()
            .find(|(lid, _)| *lid == id)
            .map(|(_, l)| l.clone());
        if let Some(listener) = listener {
            listener.on_value_change(values);
        }
    }

    /// Run `update` and publish the value it returns, as one delivery round.
    ///
    /// A listener registering concurrently either replays the state from
    /// before `update` and then receives the publication, or only replays the
    /// state after it; it never sees the new value twice.
    pub fn update_and_notify<F>(&self, update: F)
    where
        F: FnOnce() -> Option<T>,
    {
        let _guard = self.dispatch.lock();
        if let Some(value) = update() {
            for listener in self.snapshot() {
                listener.on_value_change(std::slice::from_ref(&value));
            }
        }
    }

    /// Notify every listener of a validity change.
    pub fn notify_validity_change(&self, valid: bool) {
        let _guard = self.dispatch.lock();
        for listener in self.snapshot() {
            listener.on_validity_change(valid);
        }
    }

    // Listeners may subscribe or unsubscribe from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn AttributeListener<T>>> {
        self.listeners.read().iter().map(|(_, l)| l.clone()).collect()
    }
}

impl<T> Default for AttributeNotifier<T> {
    fn default() -> Self {
        Self::new()
    }
}
