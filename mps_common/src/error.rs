//! Error type of the machine control engine.
//!
//! None of these errors is fatal to the process. Every failure degrades to
//! "this station is currently unavailable" while the engine keeps trying to
//! recover the session.

use crate::config::ConfigError;
use crate::register::{MpsRegister, ValueKind};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by sessions, dispatchers and capability calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// Connect, read or write failed at the protocol layer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An instruction or liveness check exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The device returned a value of unexpected type or shape.
    #[error("Protocol violation on {register}: expected {expected:?}, got {actual}")]
    ProtocolViolation {
        /// Register involved.
        register: MpsRegister,
        /// Declared kind of the register.
        expected: ValueKind,
        /// What arrived instead.
        actual: String,
    },

    /// Capability call attempted while the session is not ready.
    #[error("Session not ready")]
    SessionNotReady,

    /// Caller requested cancellation of the in-flight instruction.
    #[error("Instruction aborted")]
    Aborted,

    /// The session was torn down while the instruction was pending.
    #[error("Session closed")]
    SessionClosed,

    /// The station raised its lane error flag.
    #[error("Device fault on {register}: code {code}")]
    DeviceFault {
        /// Lane error register.
        register: MpsRegister,
        /// Error code reported by the station.
        code: u16,
    },

    /// The command is not available on this station type or transport.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A machine was built from an invalid station entry.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CommError {
    /// Shorthand for a [`CommError::Transport`].
    pub fn transport(msg: impl Into<String>) -> Self {
        CommError::Transport(msg.into())
    }

    /// Shorthand for a [`CommError::Unsupported`].
    pub fn unsupported(msg: impl Into<String>) -> Self {
        CommError::Unsupported(msg.into())
    }

    /// True if the error is tied to the current link and may clear after a
    /// session rebuild.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommError::Transport(_)
                | CommError::Timeout(_)
                | CommError::SessionNotReady
                | CommError::SessionClosed
        )
    }
}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::Transport(err.to_string())
    }
}

impl From<ConfigError> for CommError {
    fn from(err: ConfigError) -> Self {
        CommError::Config(err.to_string())
    }
}

/// Result alias for engine operations.
pub type CommResult<T> = Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = CommError::DeviceFault {
            register: MpsRegister::ErrorBasic,
            code: 42,
        };
        assert!(err.to_string().contains("ErrorBasic"));
        assert!(err.to_string().contains("42"));

        let err = CommError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn transient_classification() {
        assert!(CommError::transport("refused").is_transient());
        assert!(CommError::SessionClosed.is_transient());
        assert!(!CommError::Aborted.is_transient());
        assert!(!CommError::unsupported("lights").is_transient());
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(CommError::from(io), CommError::Transport(_)));
    }
}
