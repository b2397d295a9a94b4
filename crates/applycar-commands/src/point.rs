//! Apply and CAR point interfaces.
//!
//! These traits are the boundary to the channel transport. Implementations
//! deliver notifications on threads of their choosing; synchronous reads and
//! writes may fail with a [`TransportError`].

use std::fmt;
use std::sync::Arc;

use applycar_core::{AttributeListener, ListenerId};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Command verb written to an Apply point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Directive {
    Mark = 0,
    Clear = 1,
    Preset = 2,
    Start = 3,
    Stop = 4,
}

impl Directive {
    /// Numeric value written to the directive field.
    pub fn value(&self) -> i16 {
        *self as i16
    }

    /// Directive from its numeric value.
    pub fn from_value(value: i16) -> Option<Self> {
        match value {
            0 => Some(Directive::Mark),
            1 => Some(Directive::Clear),
            2 => Some(Directive::Preset),
            3 => Some(Directive::Start),
            4 => Some(Directive::Stop),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Directive::Mark => "MARK",
            Directive::Clear => "CLEAR",
            Directive::Preset => "PRESET",
            Directive::Start => "START",
            Directive::Stop => "STOP",
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Machine state reported by a CAR point.
pub trait CarState: Clone + fmt::Debug + Send + Sync + 'static {
    fn is_busy(&self) -> bool;
    fn is_error(&self) -> bool;
}

/// The standard CAR state enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CarValue {
    Idle = 0,
    Paused = 1,
    Busy = 2,
    Error = 3,
}

impl CarValue {
    pub fn from_value(value: i16) -> Option<Self> {
        match value {
            0 => Some(CarValue::Idle),
            1 => Some(CarValue::Paused),
            2 => Some(CarValue::Busy),
            3 => Some(CarValue::Error),
            _ => None,
        }
    }
}

impl CarState for CarValue {
    fn is_busy(&self) -> bool {
        matches!(self, CarValue::Busy)
    }

    fn is_error(&self) -> bool {
        matches!(self, CarValue::Error)
    }
}

/// Proxy for an Apply record.
pub trait ApplyPoint: Send + Sync {
    /// Channel name of the record.
    fn name(&self) -> &str;

    /// Write a directive.
    fn write_directive(&self, directive: Directive) -> Result<(), TransportError>;

    /// Read the error message field.
    fn message(&self) -> Result<String, TransportError>;

    /// Subscribe to the value field, which carries the client id of the last
    /// accepted directive (non-positive on rejection).
    fn add_value_listener(
        &self,
        listener: Arc<dyn AttributeListener<i32>>,
    ) -> Result<ListenerId, TransportError>;

    fn remove_value_listener(&self, id: ListenerId) -> Result<(), TransportError>;

    /// Release the underlying channels.
    fn unbind(&self) {}
}

/// Proxy for a CAR record.
pub trait CarPoint<S: CarState>: Send + Sync {
    /// Channel name of the record.
    fn name(&self) -> &str;

    /// Read the current state.
    fn state(&self) -> Result<Option<S>, TransportError>;

    /// Read the error message field.
    fn message(&self) -> Result<String, TransportError>;

    /// Subscribe to the acknowledged client id.
    fn add_clid_listener(
        &self,
        listener: Arc<dyn AttributeListener<i32>>,
    ) -> Result<ListenerId, TransportError>;

    fn remove_clid_listener(&self, id: ListenerId) -> Result<(), TransportError>;

    /// Subscribe to the state field.
    fn add_state_listener(
        &self,
        listener: Arc<dyn AttributeListener<S>>,
    ) -> Result<ListenerId, TransportError>;

    fn remove_state_listener(&self, id: ListenerId) -> Result<(), TransportError>;

    /// Release the underlying channels.
    fn unbind(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_values() {
        assert_eq!(Directive::Start.value(), 3);
        assert_eq!(Directive::from_value(1), Some(Directive::Clear));
        assert_eq!(Directive::from_value(9), None);
        assert_eq!(Directive::Start.to_string(), "START");
    }

    #[test]
    fn test_car_value_predicates() {
        assert!(CarValue::Busy.is_busy());
        assert!(!CarValue::Busy.is_error());
        assert!(CarValue::Error.is_error());
        assert!(!CarValue::Idle.is_busy());
        assert!(!CarValue::Paused.is_busy());
        assert_eq!(CarValue::from_value(2), Some(CarValue::Busy));
    }
}
