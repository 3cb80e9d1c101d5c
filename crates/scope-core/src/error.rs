//! Error types for device drivers.
//!
//! [`DeviceError`] is the domain error returned by the protocol layers
//! (transport, exchanger, tables). Capability traits and factories work in
//! `anyhow::Result` and wrap these with context, so a caller can still
//! `downcast_ref::<DeviceError>()` to tell a decode failure from a dead line.
//!
//! ## Recovery
//!
//! - Timeouts and echo mismatches are retried inside the exchanger and only
//!   surface as [`DeviceError::NoReply`] / [`DeviceError::EchoMismatch`] once
//!   the attempt budget is spent.
//! - Decode and lookup failures surface immediately. A position that matches
//!   no table entry is never coerced to a default slot.
//! - Initialization failures are fatal: the device is not usable.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse classification of a [`DeviceError`], used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Decode,
    InvalidParameter,
    Unsupported,
    Refused,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Decode => "decode",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unsupported => "unsupported",
            DriverErrorKind::Refused => "refused",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// DeviceError
// =============================================================================

/// Errors raised while talking to a device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Every attempt at an exchange came back empty or unusable.
    #[error("no usable reply to '{command}' after {attempts} attempt(s)")]
    NoReply { command: String, attempts: u32 },

    /// Every attempt got a reply belonging to some other command.
    #[error("reply '{reply}' does not answer '{command}' (after {attempts} attempt(s))")]
    EchoMismatch {
        command: String,
        reply: String,
        attempts: u32,
    },

    /// A bounded wait for an unsolicited device message ran out.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    /// A reply arrived but could not be interpreted.
    #[error("cannot decode {what} from '{raw}'")]
    Decode { what: &'static str, raw: String },

    /// The device reported a position that is not in the position table.
    #[error("device position {value} matches no position table entry")]
    UnknownPosition { value: String },

    /// A logical slot outside `0..count` was requested.
    #[error("slot {slot} is out of range (device has {count} positions)")]
    SlotOutOfRange { slot: usize, count: usize },

    /// The device answered a set command with something other than an
    /// acknowledgement.
    #[error("device refused '{command}': {reply}")]
    Refused { command: String, reply: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Shorthand for a [`DeviceError::Decode`].
    pub fn decode(what: &'static str, raw: impl Into<String>) -> Self {
        Self::Decode {
            what,
            raw: raw.into(),
        }
    }

    /// Classification for logging and for callers that branch on category.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            Self::NoReply { .. } | Self::EchoMismatch { .. } | Self::Timeout { .. } | Self::Io(_) => {
                DriverErrorKind::Communication
            }
            Self::Decode { .. } | Self::UnknownPosition { .. } => DriverErrorKind::Decode,
            Self::SlotOutOfRange { .. } | Self::InvalidParameter(_) => {
                DriverErrorKind::InvalidParameter
            }
            Self::Initialization(_) => DriverErrorKind::Initialization,
            Self::Configuration(_) => DriverErrorKind::Configuration,
            Self::Unsupported(_) => DriverErrorKind::Unsupported,
            Self::Refused { .. } => DriverErrorKind::Refused,
        }
    }

    /// True for failures that a later attempt might not hit again.
    pub fn is_transient(&self) -> bool {
        self.kind() == DriverErrorKind::Communication
    }
}

/// Result alias for the protocol layers.
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = DeviceError::NoReply {
            command: "pos?".into(),
            attempts: 3,
        };
        assert_eq!(err.kind(), DriverErrorKind::Communication);
        assert!(err.is_transient());

        let err = DeviceError::UnknownPosition { value: "7".into() };
        assert_eq!(err.kind(), DriverErrorKind::Decode);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_includes_command() {
        let err = DeviceError::NoReply {
            command: "pcount?".into(),
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("pcount?"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_survives_anyhow_round_trip() {
        let err: anyhow::Error = DeviceError::decode("position", "abc").into();
        let inner = err.downcast_ref::<DeviceError>();
        assert!(matches!(inner, Some(DeviceError::Decode { .. })));
    }
}
