//! Command and transport error types.

/// Failure of a synchronous read or write on a remote point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Channel {channel} failed: {reason}")]
    Channel { channel: String, reason: String },

    #[error("Timeout accessing channel {channel}")]
    Timeout { channel: String },

    #[error("Channel {channel} disconnected")]
    Disconnected { channel: String },
}

impl TransportError {
    /// Name of the channel that failed.
    pub fn channel(&self) -> &str {
        match self {
            TransportError::Channel { channel, .. }
            | TransportError::Timeout { channel }
            | TransportError::Disconnected { channel } => channel,
        }
    }
}

/// Reason a posted command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Command in progress")]
    InProgress,

    #[error("Apply record rejected the command: {}", .message.as_deref().unwrap_or("no message"))]
    ApplyRejected { message: Option<String> },

    #[error("CAR record reported an error: {}", .message.as_deref().unwrap_or("no message"))]
    CarError { message: Option<String> },

    #[error("Another command was triggered in apply record {apply}")]
    Superseded { apply: String },

    #[error("Timeout waiting for command completion")]
    Timeout,

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Wait interrupted")]
    Interrupted,

    #[error("Command sender {0} is unbound")]
    Unbound(String),
}

impl CommandError {
    /// Short, stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::InProgress => "in_progress",
            CommandError::ApplyRejected { .. } => "apply_rejected",
            CommandError::CarError { .. } => "car_error",
            CommandError::Superseded { .. } => "superseded",
            CommandError::Timeout => "timeout",
            CommandError::Transport(_) => "transport",
            CommandError::Interrupted => "interrupted",
            CommandError::Unbound(_) => "unbound",
        }
    }

    /// Diagnostic text reported by the remote system, if any.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            CommandError::ApplyRejected { message } | CommandError::CarError { message } => {
                message.as_deref()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CommandError::ApplyRejected {
            message: Some("bad parameter".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Apply record rejected the command: bad parameter"
        );

        let err = CommandError::CarError { message: None };
        assert_eq!(err.to_string(), "CAR record reported an error: no message");
        assert_eq!(err.remote_message(), None);
    }

    #[test]
    fn test_transport_conversion() {
        let err: CommandError = TransportError::Timeout {
            channel: "tc1:apply.DIR".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "transport");
        assert!(err.to_string().contains("tc1:apply.DIR"));
    }
}
