//! # Error Types
//!
//! Custom error types for BlueLink Bridge using `thiserror`.
//!
//! Each layer has its own error enum so callers can match on exactly the
//! failures that layer can produce:
//!
//! | Error | Raised by | Recoverable |
//! |-------|-----------|-------------|
//! | [`EncodeError`] | Wire codec (precondition violation) | Programmer error |
//! | [`DecodeError`] | Wire codec (malformed reply) | Logged, ignored |
//! | [`LinkError`] | Serial link | `Timeout` yes, `IoFailure` needs reconnect |
//! | [`RegistryError`] | Link registry | Configuration conflict |
//! | [`DispatchError`] | Link registry dispatch | Always, caller logs and continues |
//! | [`MappingError`] | Mapping validation | Rejected at creation time |
//! | [`SourceError`] | Controller event sources | Ends one router path only |
//! | [`UploadError`] | Firmware uploader | Caller decides |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for BlueLink Bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Invalid mapping in configuration
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Board registration errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Controller device errors
    #[error("Controller error: {0}")]
    Controller(String),

    /// No matching controller device found
    #[error("No game controller found")]
    ControllerNotFound,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for BlueLink Bridge
pub type Result<T> = std::result::Result<T, BridgeError>;

/// A command violated a wire-format precondition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Pin identifier is empty or not ASCII alphanumeric.
    #[error("invalid pin identifier {0:?}")]
    InvalidPin(String),

    /// A numeric field is outside its wire range.
    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Stepper pin list is empty, too long, or repeats a pin.
    #[error("invalid stepper pin set: {0}")]
    StepperPins(String),
}

/// A line received from a board could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Serial link failures.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No reply arrived within the acknowledgement window.
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    /// Transport read/write/open failed. The link is now faulted.
    #[error("I/O failure on {address}: {source}")]
    IoFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The board answered with an error reply.
    #[error("board rejected command: {0}")]
    Rejected(String),

    /// The link was closed while an operation was in flight.
    #[error("link closed")]
    Closed,

    /// The link is not in the `Connected` state.
    #[error("link is not connected")]
    NotConnected,

    /// The command could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Link registry configuration and lifecycle errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("board {0:?} is already registered")]
    DuplicateName(String),

    #[error("address {address:?} is already used by board {owner:?}")]
    AddressInUse { address: String, owner: String },

    #[error("unknown board {0:?}")]
    UnknownBoard(String),

    #[error("board {board:?}: {source}")]
    Link {
        board: String,
        #[source]
        source: LinkError,
    },

    #[error("firmware upload to {board:?} failed: {source}")]
    Upload {
        board: String,
        #[source]
        source: UploadError,
    },
}

/// Routing failures when sending a command to a board.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown board {0:?}")]
    UnknownBoard(String),

    #[error("board {0:?} is not connected")]
    NotConnected(String),

    #[error("board {board:?}: {source}")]
    Link {
        board: String,
        #[source]
        source: LinkError,
    },
}

/// Mapping configuration rejected at creation time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("mapping {id}: controller input must not be empty")]
    EmptyInput { id: u32 },

    #[error("mapping {id}: board name must not be empty")]
    EmptyBoard { id: u32 },

    #[error("mapping {id}: {source}")]
    Pin {
        id: u32,
        #[source]
        source: EncodeError,
    },

    #[error("mapping {id}: unknown pin mode {mode:?} (expected output, pwm or stepper)")]
    UnknownMode { id: u32, mode: String },

    #[error("mapping {id}: missing {field}")]
    MissingField { id: u32, field: &'static str },

    #[error("mapping {id}: PWM range {min}..{max} is invalid (need min <= max <= 255)")]
    PwmRange { id: u32, min: u16, max: u16 },

    #[error("mapping {id}: stepper needs 2 or 4 distinct pins, got {count}")]
    StepperPinCount { id: u32, count: usize },

    #[error("mapping {id}: stepper pin {pin} is listed twice")]
    DuplicateStepperPin { id: u32, pin: String },

    #[error("mapping {id}: {field} must be greater than 0")]
    NotPositive { id: u32, field: &'static str },

    #[error("mapping {id}: dead_zone {value} must be in 0.0..1.0")]
    DeadZone { id: u32, value: f32 },

    #[error("mapping {id}: input range {min}..{max} is empty")]
    InputRange { id: u32, min: f32, max: f32 },

    #[error("duplicate mapping id {0}")]
    DuplicateId(u32),
}

/// A controller event source failed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("controller {source_name:?} read failed: {error}")]
    Read {
        source_name: String,
        #[source]
        error: std::io::Error,
    },

    #[error("controller {0:?} disconnected")]
    Disconnected(String),
}

/// Firmware upload failures.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0} not found or not runnable")]
    ToolNotFound(String),

    #[error("unsupported firmware artifact {0} (expected .ino or .hex)")]
    UnsupportedArtifact(PathBuf),

    #[error("{stage} failed: {stderr}")]
    Failed { stage: &'static str, stderr: String },

    #[error("upload timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
