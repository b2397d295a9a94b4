//! In-process Apply and CAR points.
//!
//! The simulated points behave like channel proxies: values are pushed to
//! listeners synchronously on the thread that sets them, a new listener first
//! receives the current value, and reads and writes can be made to fail.
//! A [`Responder`] plays the remote side of the protocol so a sender can be
//! exercised without a control system.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use applycar_core::{AttributeListener, AttributeNotifier, ListenerId, Scheduler};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;
use crate::point::{ApplyPoint, CarPoint, CarState, CarValue, Directive};

type DirectiveHook = Arc<dyn Fn(Directive) + Send + Sync>;

/// Simulated Apply record.
pub struct SimulatedApply {
    name: String,
    state: Mutex<ApplyState>,
    value: AttributeNotifier<i32>,
    hook: RwLock<Option<DirectiveHook>>,
    unbound: AtomicBool,
}

#[derive(Default)]
struct ApplyState {
    value: i32,
    message: String,
    directives: Vec<Directive>,
    write_error: Option<TransportError>,
    read_error: Option<TransportError>,
}

impl SimulatedApply {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ApplyState::default()),
            value: AttributeNotifier::new(),
            hook: RwLock::new(None),
            unbound: AtomicBool::new(false),
        }
    }

    /// Publish a new client id (non-positive for a rejection).
    pub fn set_value(&self, value: i32) {
        self.state.lock().value = value;
        self.value.notify_value_change(std::slice::from_ref(&value));
    }

    pub fn value(&self) -> i32 {
        self.state.lock().value
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.state.lock().message = message.into();
    }

    /// Make directive writes fail until cleared with `None`.
    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.state.lock().write_error = error;
    }

    /// Make message reads fail until cleared with `None`.
    pub fn fail_reads(&self, error: Option<TransportError>) {
        self.state.lock().read_error = error;
    }

    /// Directives written so far, oldest first.
    pub fn directives(&self) -> Vec<Directive> {
        self.state.lock().directives.clone()
    }

    /// Call `hook` after every successful directive write.
    pub fn on_directive<F>(&self, hook: F)
    where
        F: Fn(Directive) + Send + Sync + 'static,
    {
        *self.hook.write() = Some(Arc::new(hook));
    }

    pub fn listener_count(&self) -> usize {
        self.value.listener_count()
    }

    pub fn is_unbound(&self) -> bool {
        self.unbound.load(Ordering::SeqCst)
    }

    fn channel_error(&self, reason: &str) -> TransportError {
        TransportError::Channel {
            channel: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl ApplyPoint for SimulatedApply {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_directive(&self, directive: Directive) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if let Some(error) = &state.write_error {
                return Err(error.clone());
            }
            state.directives.push(directive);
        }
        debug!("{} <- {}", self.name, directive);

        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(directive);
        }
        Ok(())
    }

    fn message(&self) -> Result<String, TransportError> {
        let state = self.state.lock();
        match &state.read_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.message.clone()),
        }
    }

    fn add_value_listener(
        &self,
        listener: Arc<dyn AttributeListener<i32>>,
    ) -> Result<ListenerId, TransportError> {
        if self.is_unbound() {
            return Err(self.channel_error("unbound"));
        }
        Ok(self
            .value
            .add_listener_with_replay(listener, || Some(self.state.lock().value)))
    }

    fn remove_value_listener(&self, id: ListenerId) -> Result<(), TransportError> {
        self.value
            .remove_listener(id)
            .map_err(|e| self.channel_error(&e.to_string()))
    }

    fn unbind(&self) {
        self.unbound.store(true, Ordering::SeqCst);
    }
}

/// Simulated CAR record.
pub struct SimulatedCar<S> {
    name: String,
    state: Mutex<CarRecord<S>>,
    clid: AttributeNotifier<i32>,
    car_state: AttributeNotifier<S>,
    unbound: AtomicBool,
}

struct CarRecord<S> {
    state: Option<S>,
    clid: Option<i32>,
    message: String,
    read_error: Option<TransportError>,
    subscribe_error: Option<TransportError>,
}

impl<S: CarState> SimulatedCar<S> {
    /// Create a CAR record with no state and no client id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CarRecord {
                state: None,
                clid: None,
                message: String::new(),
                read_error: None,
                subscribe_error: None,
            }),
            clid: AttributeNotifier::new(),
            car_state: AttributeNotifier::new(),
            unbound: AtomicBool::new(false),
        }
    }

    /// Create a CAR record in the given state.
    pub fn with_state(name: impl Into<String>, state: S) -> Self {
        let car = Self::new(name);
        car.state.lock().state = Some(state);
        car
    }

    /// Publish a new state.
    pub fn set_state(&self, state: S) {
        self.state.lock().state = Some(state.clone());
        self.car_state.notify_value_change(std::slice::from_ref(&state));
    }

    /// Publish a new acknowledged client id.
    pub fn set_clid(&self, clid: i32) {
        self.state.lock().clid = Some(clid);
        self.clid.notify_value_change(std::slice::from_ref(&clid));
    }

    /// Publish a client id followed by a state, as a CAR record does when it
    /// picks up a command.
    pub fn acknowledge(&self, clid: i32, state: S) {
        self.set_clid(clid);
        self.set_state(state);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.state.lock().message = message.into();
    }

    pub fn current_state(&self) -> Option<S> {
        self.state.lock().state.clone()
    }

    pub fn current_clid(&self) -> Option<i32> {
        self.state.lock().clid
    }

    /// Make state and message reads fail until cleared with `None`.
    pub fn fail_reads(&self, error: Option<TransportError>) {
        self.state.lock().read_error = error;
    }

    /// Make listener registration fail until cleared with `None`.
    pub fn fail_subscriptions(&self, error: Option<TransportError>) {
        self.state.lock().subscribe_error = error;
    }

    pub fn listener_count(&self) -> usize {
        self.clid.listener_count() + self.car_state.listener_count()
    }

    pub fn is_unbound(&self) -> bool {
        self.unbound.load(Ordering::SeqCst)
    }

    fn check_subscribe(&self) -> Result<(), TransportError> {
        if let Some(error) = &self.state.lock().subscribe_error {
            return Err(error.clone());
        }
        if self.is_unbound() {
            return Err(self.channel_error("unbound"));
        }
        Ok(())
    }

    fn channel_error(&self, reason: &str) -> TransportError {
        TransportError::Channel {
            channel: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl<S: CarState> CarPoint<S> for SimulatedCar<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<Option<S>, TransportError> {
        let record = self.state.lock();
        match &record.read_error {
            Some(error) => Err(error.clone()),
            None => Ok(record.state.clone()),
        }
    }

    fn message(&self) -> Result<String, TransportError> {
        let record = self.state.lock();
        match &record.read_error {
            Some(error) => Err(error.clone()),
            None => Ok(record.message.clone()),
        }
    }

    fn add_clid_listener(
        &self,
        listener: Arc<dyn AttributeListener<i32>>,
    ) -> Result<ListenerId, TransportError> {
        self.check_subscribe()?;
        Ok(self
            .clid
            .add_listener_with_replay(listener, || self.state.lock().clid))
    }

    fn remove_clid_listener(&self, id: ListenerId) -> Result<(), TransportError> {
        self.clid
            .remove_listener(id)
            .map_err(|e| self.channel_error(&e.to_string()))
    }

    fn add_state_listener(
        &self,
        listener: Arc<dyn AttributeListener<S>>,
    ) -> Result<ListenerId, TransportError> {
        self.check_subscribe()?;
        Ok(self
            .car_state
            .add_listener_with_replay(listener, || self.state.lock().state.clone()))
    }

    fn remove_state_listener(&self, id: ListenerId) -> Result<(), TransportError> {
        self.car_state
            .remove_listener(id)
            .map_err(|e| self.channel_error(&e.to_string()))
    }

    fn unbind(&self) {
        self.unbound.store(true, Ordering::SeqCst);
    }
}

/// How a [`Responder`] reacts to `START`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behaviour {
    /// Accept the command; the CAR record goes BUSY after `delay`
    Accept { delay: Duration },
    /// Accept the command; the CAR record goes ERROR after `delay`
    CarFault { delay: Duration, message: String },
    /// The Apply record rejects the command
    Reject { message: String },
    /// Never answer
    Silent,
}

/// Remote side of the Apply/CAR protocol for a simulated record pair.
///
/// Each `START` allocates the next client id. The Apply record reports it
/// from a scheduler task, and the CAR record follows after the configured
/// delay.
pub struct Responder {
    apply: Arc<SimulatedApply>,
    car: Arc<SimulatedCar<CarValue>>,
    scheduler: Arc<dyn Scheduler>,
    behaviour: Mutex<Behaviour>,
    next_clid: AtomicI32,
}

impl Responder {
    /// Install a responder on `apply`, replacing any previous directive hook.
    pub fn attach(
        apply: Arc<SimulatedApply>,
        car: Arc<SimulatedCar<CarValue>>,
        scheduler: Arc<dyn Scheduler>,
        behaviour: Behaviour,
    ) -> Arc<Self> {
        let first = apply.value().max(0) + 1;
        let responder = Arc::new(Self {
            apply: apply.clone(),
            car,
            scheduler,
            behaviour: Mutex::new(behaviour),
            next_clid: AtomicI32::new(first),
        });

        let weak = Arc::downgrade(&responder);
        apply.on_directive(move |directive| {
            if let Some(responder) = weak.upgrade() {
                responder.on_directive(directive);
            }
        });
        responder
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub fn behaviour(&self) -> Behaviour {
        self.behaviour.lock().clone()
    }

    fn on_directive(self: &Arc<Self>, directive: Directive) {
        match directive {
            Directive::Start => {}
            Directive::Stop | Directive::Clear => {
                let car = self.car.clone();
                self.scheduler
                    .execute(Box::new(move || car.set_state(CarValue::Idle)));
                return;
            }
            Directive::Mark | Directive::Preset => return,
        }

        let behaviour = self.behaviour();
        if behaviour == Behaviour::Silent {
            return;
        }

        let clid = self.next_clid.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        self.scheduler.execute(Box::new(move || match behaviour {
            Behaviour::Reject { message } => {
                this.apply.set_message(message);
                this.apply.set_value(-1);
            }
            Behaviour::Accept { delay } => {
                this.apply.set_value(clid);
                let car = this.car.clone();
                this.scheduler.schedule(
                    delay,
                    Box::new(move || car.acknowledge(clid, CarValue::Busy)),
                );
            }
            Behaviour::CarFault { delay, message } => {
                this.apply.set_value(clid);
                let car = this.car.clone();
                this.scheduler.schedule(
                    delay,
                    Box::new(move || {
                        car.set_message(message);
                        car.acknowledge(clid, CarValue::Error);
                    }),
                );
            }
            Behaviour::Silent => {}
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use applycar_core::value_listener;

    fn recorder<T: Clone + Send + Sync + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<dyn AttributeListener<T>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = value_listener(move |values: &[T]| {
            sink.lock().extend(values.iter().cloned());
        });
        (seen, listener)
    }

    #[test]
    fn test_apply_records_directives_and_replays_value() {
        let apply = SimulatedApply::new("tc1:apply");
        apply.set_value(4);
        apply.write_directive(Directive::Start).unwrap();
        apply.write_directive(Directive::Clear).unwrap();
        assert_eq!(apply.directives(), vec![Directive::Start, Directive::Clear]);

        let (seen, listener) = recorder();
        apply.add_value_listener(listener).unwrap();
        apply.set_value(5);
        assert_eq!(*seen.lock(), vec![4, 5]);
    }

    #[test]
    fn test_apply_write_failure() {
        let apply = SimulatedApply::new("tc1:apply");
        apply.fail_writes(Some(TransportError::Disconnected {
            channel: "tc1:apply.DIR".to_string(),
        }));
        assert!(apply.write_directive(Directive::Start).is_err());
        assert!(apply.directives().is_empty());

        apply.fail_writes(None);
        assert!(apply.write_directive(Directive::Start).is_ok());
    }

    #[test]
    fn test_car_acknowledge_order() {
        let car = SimulatedCar::<CarValue>::new("tc1:car");
        let (clids, clid_listener) = recorder();
        let (states, state_listener) = recorder();
        car.add_clid_listener(clid_listener).unwrap();
        car.add_state_listener(state_listener).unwrap();

        car.acknowledge(3, CarValue::Busy);
        assert_eq!(*clids.lock(), vec![3]);
        assert_eq!(*states.lock(), vec![CarValue::Busy]);
        assert_eq!(car.state().unwrap(), Some(CarValue::Busy));
    }

    #[test]
    fn test_car_read_and_subscribe_failures() {
        let car = SimulatedCar::with_state("tc1:car", CarValue::Idle);
        car.fail_reads(Some(TransportError::Timeout {
            channel: "tc1:car.VAL".to_string(),
        }));
        assert!(car.state().is_err());
        assert!(car.message().is_err());

        car.fail_subscriptions(Some(TransportError::Disconnected {
            channel: "tc1:car.CLID".to_string(),
        }));
        let (_, listener) = recorder::<i32>();
        assert!(car.add_clid_listener(listener).is_err());
    }
}
