//! Apply/CAR command sending.
//!
//! Provides:
//! - Proxy traits for Apply and CAR records
//! - The handshake state machine correlating a posted command with its
//!   acknowledgement
//! - The command sender and its completion monitors
//! - Transition events for diagnostics
//! - Simulated record pairs for tests and demos

pub mod command;
pub mod error;
pub mod events;
pub mod point;
pub mod protocol;
pub mod sender;
pub mod sim;

// Re-exports
pub use command::{CommandId, CommandListener, CommandMonitor, CommandOutcome, CommandStatus};

pub use error::{CommandError, TransportError};

pub use events::{TransitionBus, TransitionEvent, TransitionTrigger};

pub use point::{ApplyPoint, CarPoint, CarState, CarValue, Directive};

pub use protocol::{ProtocolState, Resolution, Step};

pub use sender::{CommandSender, SenderConfig};

pub use sim::{Behaviour, Responder, SimulatedApply, SimulatedCar};
