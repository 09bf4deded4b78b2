//! Error handling for cnclink
//!
//! A single structured error type covers every failure the controller layer
//! can surface: transport faults, malformed device traffic, device-reported
//! errors, cancellation, probe outcomes, and safety conditions. The set of
//! kinds is closed and owned by this module; there is no process-wide error
//! registry.
//!
//! All error types use `thiserror` for ergonomic error handling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a [`ControllerError`].
///
/// The kind is the stable, wire-friendly discriminant used by upstream
/// consumers (serialized in snake_case, e.g. `comm_error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure communicating with the device
    CommError,
    /// Malformed message received from the device
    ParseError,
    /// Device reported a generic error
    MachineError,
    /// Operation aborted by cancel/reset/stream-error fan-out
    Cancelled,
    /// Probe reached the commanded endpoint without tripping
    ProbeEnd,
    /// Device refused a probe operation because tripping did not occur
    ProbeNotTripped,
    /// Probe already in tripped state on entry
    ProbeInitialState,
    /// Safety door/interlock disengaged
    SafetyInterlock,
    /// Limit switch engaged unexpectedly
    LimitHit,
    /// Operation declared unsupported by the backend
    Unsupported,
}

impl ErrorKind {
    /// Wire name of the kind (snake_case)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommError => "comm_error",
            Self::ParseError => "parse_error",
            Self::MachineError => "machine_error",
            Self::Cancelled => "cancelled",
            Self::ProbeEnd => "probe_end",
            Self::ProbeNotTripped => "probe_not_tripped",
            Self::ProbeInitialState => "probe_initial_state",
            Self::SafetyInterlock => "safety_interlock",
            Self::LimitHit => "limit_hit",
            Self::Unsupported => "unsupported",
        }
    }

    /// Kinds that always latch the controller, regardless of detail
    ///
    /// `machine_error` is absent: a device error is instruction-local unless
    /// the value itself is marked unrecoverable, so fatality for that kind
    /// is decided per value by [`ControllerError::is_fatal`].
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CommError | Self::SafetyInterlock | Self::LimitHit
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller error type
///
/// Carries the structured detail for each [`ErrorKind`]. Values are cloneable
/// and serializable so they can be latched into the state vector and included
/// in status snapshots.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerError {
    /// Transport failure communicating with the device
    #[error("communication failure: {message}")]
    Comm {
        /// What went wrong at the transport layer.
        message: String,
    },

    /// Malformed message received from the device
    #[error("malformed message from device: {message}")]
    Parse {
        /// Description of the malformed traffic.
        message: String,
    },

    /// Device reported an error
    #[error("device error: {message}")]
    Machine {
        /// Firmware error/alarm code, when the dialect provides one.
        code: Option<u32>,
        /// Human-readable device message.
        message: String,
        /// Dialect-specific detail payload.
        data: Option<serde_json::Value>,
        /// False for device alarms: the error latches the controller and
        /// only `clear_error`/`reset` recover it.
        recoverable: bool,
    },

    /// Operation aborted by `cancel`, `reset`, or stream-error fan-out
    #[error("operation cancelled")]
    Cancelled,

    /// Probe reached the commanded endpoint without tripping
    #[error("probe reached endpoint without tripping")]
    ProbeEnd,

    /// Device refused the probe because tripping did not occur
    #[error("device reported probe did not trip")]
    ProbeNotTripped,

    /// Probe already in tripped state when the cycle started
    #[error("probe already tripped before cycle start")]
    ProbeInitialState,

    /// Safety door/interlock disengaged
    #[error("safety interlock disengaged")]
    SafetyInterlock,

    /// Limit switch engaged unexpectedly
    #[error("limit switch engaged")]
    LimitHit {
        /// The axis whose limit switch tripped, if known.
        axis: Option<char>,
    },

    /// Operation declared unsupported by this backend
    #[error("operation not supported by this controller: {operation}")]
    Unsupported {
        /// The contract operation that is unsupported.
        operation: String,
    },
}

impl ControllerError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Comm { .. } => ErrorKind::CommError,
            Self::Parse { .. } => ErrorKind::ParseError,
            Self::Machine { .. } => ErrorKind::MachineError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ProbeEnd => ErrorKind::ProbeEnd,
            Self::ProbeNotTripped => ErrorKind::ProbeNotTripped,
            Self::ProbeInitialState => ErrorKind::ProbeInitialState,
            Self::SafetyInterlock => ErrorKind::SafetyInterlock,
            Self::LimitHit { .. } => ErrorKind::LimitHit,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }

    /// Create a transport error from a message
    pub fn comm(message: impl Into<String>) -> Self {
        Self::Comm {
            message: message.into(),
        }
    }

    /// Create a parse error from a message
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a recoverable device error without a firmware code
    pub fn machine(message: impl Into<String>) -> Self {
        Self::Machine {
            code: None,
            message: message.into(),
            data: None,
            recoverable: true,
        }
    }

    /// Create a recoverable device error carrying a firmware code
    pub fn machine_code(code: u32, message: impl Into<String>) -> Self {
        Self::Machine {
            code: Some(code),
            message: message.into(),
            data: None,
            recoverable: true,
        }
    }

    /// Create an unrecoverable device alarm
    ///
    /// Alarms latch the controller: they go through the fatal path rather
    /// than terminating a single instruction.
    pub fn alarm(code: u32, message: impl Into<String>) -> Self {
        Self::Machine {
            code: Some(code),
            message: message.into(),
            data: None,
            recoverable: false,
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Whether this error must latch the whole controller
    ///
    /// Always-fatal kinds latch unconditionally; a `machine_error` latches
    /// only when the device reported it as unrecoverable (an alarm).
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
            || matches!(
                self,
                Self::Machine {
                    recoverable: false,
                    ..
                }
            )
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        Self::Comm {
            message: err.to_string(),
        }
    }
}

/// Result type using [`ControllerError`]
pub type Result<T> = std::result::Result<T, ControllerError>;
