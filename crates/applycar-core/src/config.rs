//! Shared configuration defaults and environment lookups.
//!
//! Every tunable has a constant default and an environment variable that can
//! override it. Components take explicit configuration structs; the helpers
//! here only provide their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable names
pub mod env_vars {
    /// Enables per-transition debug tracing of command senders
    pub const TRACE: &str = "APPLYCAR_TRACE";
    /// Default command timeout in milliseconds (0 disables the timeout)
    pub const COMMAND_TIMEOUT_MS: &str = "APPLYCAR_COMMAND_TIMEOUT_MS";
    /// Default settle window for debounce filters in milliseconds
    pub const SETTLE_MS: &str = "APPLYCAR_SETTLE_MS";
    /// Emit JSON logs from the CLI
    pub const LOG_JSON: &str = "APPLYCAR_LOG_JSON";
}

/// Default values
pub mod defaults {
    /// No timeout unless configured
    pub const COMMAND_TIMEOUT_MS: u64 = 0;
    pub const SETTLE_MS: u64 = 50;
    /// Capacity of transition event broadcast channels
    pub const TRANSITION_CHANNEL_CAPACITY: usize = 256;
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Whether transition tracing is enabled by the environment.
pub fn trace_enabled() -> bool {
    env_flag(env_vars::TRACE)
}

/// Whether JSON log output is requested.
pub fn log_json() -> bool {
    env_flag(env_vars::LOG_JSON)
}

/// Default command timeout from the environment, or the built-in default.
pub fn command_timeout_ms() -> u64 {
    env_parse(env_vars::COMMAND_TIMEOUT_MS).unwrap_or(defaults::COMMAND_TIMEOUT_MS)
}

/// Default settle window from the environment, or the built-in default.
pub fn settle_ms() -> u64 {
    env_parse(env_vars::SETTLE_MS).unwrap_or(defaults::SETTLE_MS)
}

/// Debounce filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StabilizerConfig {
    /// Minimum time a value must stay unchanged before it is published
    pub settle_ms: u64,
}

impl StabilizerConfig {
    /// Build from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            settle_ms: settle_ms(),
        }
    }

    /// Settle window as a duration.
    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            settle_ms: defaults::SETTLE_MS,
        }
    }
}
