use std::io;
use thiserror::Error;

use super::types::ConnectionState;

/// Error types for the station integration core
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Command timed out: {0}")]
    CommandTimeout(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Creates a new command validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Creates a new busy-device error
    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    /// Creates a new command timeout error
    pub fn command_timeout(msg: impl Into<String>) -> Self {
        Error::CommandTimeout(msg.into())
    }

    /// Creates a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new closed-channel error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Error::ChannelClosed(msg.into())
    }

    /// Whether this error means the transport itself is gone.
    ///
    /// Only these errors move a connection into the `Error` state; everything
    /// else is reported to the caller and leaves the connection alone.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("antenna 9 does not exist");
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.to_string(), "Validation error: antenna 9 does not exist");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn test_command_errors_are_not_transport() {
        assert!(!Error::command_timeout("p").is_transport());
        assert!(!Error::decode("garbage").is_transport());
        assert!(!Error::busy("rotator").is_transport());
        assert!(Error::transport("closed").is_transport());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::InvalidTransition {
            from: ConnectionState::Disconnected,
            to: ConnectionState::Error,
        };
        assert_eq!(err.to_string(), "Invalid transition from Disconnected to Error");
    }
}
