//! Error types for the bridge.
//!
//! Precondition failures (state, authorization, teardown) are returned
//! synchronously from the call that violated them. Failures raised by the
//! native service after a session started travel through the error channel
//! as [`RecognitionError`] values instead.

use std::fmt;

use thiserror::Error;

use crate::session::SessionState;

/// Errors returned synchronously by bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The operation is not valid in the session's current state
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// `start` was called before authorization was granted
    #[error("speech recognition authorization has not been granted")]
    AuthorizationRequired,

    /// The user refused speech recognition
    #[error("speech recognition authorization was denied")]
    AuthorizationDenied,

    /// Speech recognition is restricted on this device
    #[error("speech recognition is restricted on this device")]
    AuthorizationRestricted,

    /// The session has been torn down
    #[error("session has been disposed")]
    Disposed,

    /// The native platform refused to create a recognizer
    #[error("native recognizer failure: {0}")]
    NativeFailure(RecognitionError),

    /// A delivery channel could not be created
    #[error("{channel} channel unavailable: {reason}")]
    DispatcherUnavailable {
        channel: &'static str,
        reason: &'static str,
    },

    /// A runtime-thread operation was invoked from another thread
    #[error("{operation} must run on the runtime thread")]
    WrongThread { operation: &'static str },

    /// The bridge exports were already registered in this process
    #[error("speech bridge is already registered")]
    AlreadyRegistered,

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Payload of the error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionError {
    pub code: i64,
    pub message: String,
}

impl RecognitionError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RecognitionError {}

/// Well-known error codes raised by the bridge's own backends.
///
/// Platform-originated codes (e.g. `NSError` codes) are passed through as-is
/// and may overlap with these.
pub mod codes {
    /// The recognizer is not available for the configured locale
    pub const UNAVAILABLE: i64 = 1;
    /// The recognition request could not be created
    pub const REQUEST_FAILED: i64 = 2;
    /// The microphone reports no usable input format
    pub const NO_INPUT: i64 = 3;
    /// The audio engine failed to start
    pub const AUDIO_ENGINE: i64 = 4;
    /// The recognition task failed
    pub const RECOGNITION: i64 = 5;
    /// The native recognizer could not be created
    pub const ACQUIRE_FAILED: i64 = 6;
    /// No speech model was found
    pub const MODEL_MISSING: i64 = 7;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_and_native_failures_read_differently() {
        let denied = BridgeError::AuthorizationDenied.to_string();
        let native =
            BridgeError::NativeFailure(RecognitionError::new(codes::UNAVAILABLE, "offline"))
                .to_string();

        assert!(denied.contains("denied"));
        assert_eq!(native, "native recognizer failure: [1] offline");
    }

    #[test]
    fn invalid_state_names_operation_and_state() {
        let err = BridgeError::InvalidState {
            operation: "start",
            state: SessionState::Listening,
        };
        assert_eq!(err.to_string(), "cannot start while session is listening");
    }
}
