//! Timestamp provision.

use chrono::{DateTime, Utc};

/// Source of wall-clock timestamps.
pub trait TimestampProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Timestamps from the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimestampProvider for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
