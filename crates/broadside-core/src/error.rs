//! Error types for Broadside

use thiserror::Error;

/// Result type for Broadside operations
pub type Result<T> = std::result::Result<T, BroadsideError>;

/// Broadside error types
#[derive(Debug, Error)]
pub enum BroadsideError {
    /// Caller supplied a value that violates a precondition
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// OS-level allocation or descriptor failure
    #[error("Resource error: {0}")]
    Resource(String),

    /// Network-level failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation invalid for the current lifecycle state
    #[error("State error: {0}")]
    State(String),

    /// A bot sent a message that violates the wire grammar or handshake
    #[error("Protocol error: {reason} ({line:?}) from bot '{bot}'")]
    Protocol {
        bot: String,
        line: String,
        reason: String,
    },
}

impl BroadsideError {
    /// Build a protocol error for an offending line
    pub fn protocol(
        bot: impl Into<String>,
        line: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        BroadsideError::Protocol {
            bot: bot.into(),
            line: line.into(),
            reason: reason.into(),
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, BroadsideError::Protocol { .. })
    }

    pub fn is_state(&self) -> bool {
        matches!(self, BroadsideError::State(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_names_line_and_bot() {
        let err = BroadsideError::protocol("Rufus", "X|junk", "unexpected message code");
        let text = err.to_string();
        assert!(text.contains("X|junk"));
        assert!(text.contains("Rufus"));
        assert!(err.is_protocol());
        assert!(!err.is_state());
    }
}
