//! Core types for the applycar driver.
//!
//! This crate holds the pieces that do not depend on the Apply/CAR protocol
//! itself:
//! - Observable attributes and their listeners
//! - Fan-out of value and validity changes to subscribers
//! - The debounce filter used to stabilise jittery signals
//! - The scheduling facility used for timers and deferred work
//! - Timestamp provision and environment-driven configuration

pub mod attribute;
pub mod clock;
pub mod config;
pub mod error;
pub mod notifier;
pub mod scheduler;
pub mod stabilizer;

// Re-exports
pub use attribute::{Attribute, AttributeListener, ListenerId, MemoryAttribute, value_listener};

pub use clock::{SystemClock, TimestampProvider};

pub use config::StabilizerConfig;

pub use error::{CoreError, Result};

pub use notifier::AttributeNotifier;

pub use scheduler::{Scheduler, Task, TimerHandle, TokioScheduler};

pub use stabilizer::DebounceFilter;
