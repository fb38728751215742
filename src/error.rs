//! Custom error types for the scan controller.
//!
//! This module defines the primary error type, `ScanError`, used by every layer of the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent way to
//! report failures, from parameter validation and state-machine misuse to device and
//! file-writer problems.
//!
//! ## Error Hierarchy
//!
//! `ScanError` consolidates the following kinds:
//!
//! - **`ValidationDidNotConverge`**: parts kept tweaking parameters past the iteration cap.
//! - **`InconsistentCoordinateSystem`** / **`MissingScannable`**: the axes to move cannot be
//!   mapped onto a single motion-controller coordinate system.
//! - **`ParameterOutOfRange`**: a scan parameter is outside what a part can honour.
//! - **`WriterStalled`** / **`FrameTimeout`**: progress stopped arriving from a device.
//! - **`BadTransition`**: a controller method was called in a state where it is not writeable.
//! - **`Aborted`**: cooperative cancellation. This is never a fault.
//! - **`Device`**: an opaque error reported by a subordinate block.
//!
//! The error is `Clone` so that a single device future can be observed by several waiters;
//! I/O and serialization failures are captured as messages for the same reason.

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for scan coordination.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Parts were still returning parameter tweaks after the iteration cap.
    #[error("Validation did not converge after {iterations} iterations")]
    ValidationDidNotConverge {
        /// Number of validate rounds that were attempted
        iterations: usize,
    },

    /// The axes to move span zero or several coordinate systems, or share a CS axis.
    #[error("Inconsistent coordinate system: {0}")]
    InconsistentCoordinateSystem(String),

    /// An axis was requested that no part knows how to move.
    #[error("Missing scannable: {0}")]
    MissingScannable(String),

    /// A scan parameter is outside the range a part can honour.
    #[error("Parameter out of range: {0}")]
    ParameterOutOfRange(String),

    /// The HDF writer's unique id did not advance within the frame timeout.
    #[error("Writer stalled: no frame for {seconds:.1}s (unique id {unique_id})")]
    WriterStalled {
        /// Seconds since the last unique id change
        seconds: f64,
        /// Last unique id observed
        unique_id: i64,
    },

    /// A device stopped reporting progress within its event timeout.
    #[error("Timed out after {seconds:.1}s waiting for {what}")]
    FrameTimeout {
        /// What was being waited for
        what: String,
        /// Event timeout that expired
        seconds: f64,
    },

    /// A controller method was called in a state where it is not writeable.
    #[error("Cannot {method} in state {state}")]
    BadTransition {
        /// Method that was rejected
        method: String,
        /// State the controller was in
        state: String,
    },

    /// Cooperative cancellation. Never drives the controller into Fault.
    #[error("Aborted")]
    Aborted,

    /// Error reported by a subordinate block.
    #[error("Device error from '{mri}': {message}")]
    Device {
        /// Block that reported the error
        mri: String,
        /// Device message
        message: String,
    },

    /// Semantic configuration error (config file, exports, designs).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// No block registered under the requested mri.
    #[error("Unknown block '{0}'")]
    UnknownBlock(String),

    /// The block has no attribute with this name.
    #[error("Block '{mri}' has no attribute '{attribute}'")]
    UnknownAttribute {
        /// Block that was queried
        mri: String,
        /// Missing attribute
        attribute: String,
    },

    /// The block has no method with this name.
    #[error("Block '{mri}' has no method '{method}'")]
    UnknownMethod {
        /// Block that was queried
        mri: String,
        /// Missing method
        method: String,
    },

    /// A hook handler received a payload meant for another hook.
    #[error("Hook {hook} does not carry {expected} arguments")]
    WrongHookArgs {
        /// Hook being dispatched
        hook: String,
        /// Payload the handler expected
        expected: &'static str,
    },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON/XML (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ScanError {
    /// Build a device error for the given block.
    pub fn device(mri: impl Into<String>, message: impl Into<String>) -> Self {
        ScanError::Device {
            mri: mri.into(),
            message: message.into(),
        }
    }

    /// Build a bad-transition error.
    pub fn bad_transition(method: impl Into<String>, state: impl std::fmt::Display) -> Self {
        ScanError::BadTransition {
            method: method.into(),
            state: state.to_string(),
        }
    }

    /// True for cooperative cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, ScanError::Aborted)
    }
}

impl From<std::io::Error> for ScanError {
    fn from(value: std::io::Error) -> Self {
        ScanError::Io(value.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(value: serde_json::Error) -> Self {
        ScanError::Serialization(value.to_string())
    }
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Configuration(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_distinguished_by_type() {
        assert!(ScanError::Aborted.is_aborted());
        assert!(!ScanError::device("PMAC", "Aborted").is_aborted());
    }

    #[test]
    fn io_errors_are_captured_as_messages() {
        let err: ScanError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such design").into();
        assert_eq!(err, ScanError::Io("no such design".into()));
        assert_eq!(err.to_string(), "I/O error: no such design");
    }

    #[test]
    fn bad_transition_message_names_method_and_state() {
        let err = ScanError::bad_transition("configure", "Armed");
        assert_eq!(err.to_string(), "Cannot configure in state Armed");
    }
}
