//! Observer error types

use sensorlab_codec::{DecodeError, EncodeError};

/// Result type for observer operations
pub type Result<T> = std::result::Result<T, ObserverError>;

/// Errors raised by the observer's state machines and their collaborators
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// Missing manifest members, unknown schedule actions, bad settings
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A controller command exited with a nonzero status
    #[error("command \"{command}\" failed with error: {code}")]
    Command { command: String, code: i32 },

    /// Serial framing module or port failure
    #[error("serial error: {0}")]
    Serial(String),

    /// Output delivery failure
    #[error("transport error: {0}")]
    Transport(String),

    #[error("command {command} forbidden in state {state}")]
    InvalidState { command: &'static str, state: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObserverError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ObserverError::Configuration(message.into())
    }

    pub fn invalid_state(command: &'static str, state: impl ToString) -> Self {
        ObserverError::InvalidState {
            command,
            state: state.to_string(),
        }
    }
}
