//! # Wire Protocol Constants and Types
//!
//! Core definitions for the colon-delimited, newline-terminated board protocol.
//!
//! ## Frames
//!
//! | Command | Frame |
//! |---------|-------|
//! | Test pin | `TEST:<pin>` |
//! | Digital write | `DIGITAL:<pin>:<0\|1>` |
//! | PWM duty | `PWM:<pin>:<duty>` |
//! | Stepper move | `STEPPER:<p1,p2,...>:<steps>:<speed_rpm>` |
//!
//! Replies are `OK`, `OK:<echoed frame>` or `ERR:<message>`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EncodeError;

/// Field separator inside a frame
pub const FIELD_SEPARATOR: char = ':';

/// Separator between stepper pins
pub const PIN_LIST_SEPARATOR: char = ',';

/// Frame terminator
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Command keywords
pub const KEYWORD_TEST: &str = "TEST";
pub const KEYWORD_DIGITAL: &str = "DIGITAL";
pub const KEYWORD_PWM: &str = "PWM";
pub const KEYWORD_STEPPER: &str = "STEPPER";

/// Reply keywords
pub const REPLY_OK: &str = "OK";
pub const REPLY_ERR: &str = "ERR";

/// PWM duty range (8-bit: 0-255)
pub const DUTY_MIN: u16 = 0;
pub const DUTY_MAX: u16 = 255;

/// Maximum number of pins a stepper driver can use
pub const STEPPER_MAX_PINS: usize = 4;

/// Board pin identifier such as `13`, `A0` or `D7`.
///
/// Always non-empty ASCII alphanumeric, so it can never break frame framing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PinId(String);

impl PinId {
    /// Validate and wrap a pin name.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidPin`] for empty or non-alphanumeric names.
    ///
    /// # Examples
    ///
    /// ```
    /// use bluelink_bridge::wire::PinId;
    ///
    /// assert!(PinId::new("A0").is_ok());
    /// assert!(PinId::new("1:2").is_err());
    /// ```
    pub fn new(name: impl Into<String>) -> Result<Self, EncodeError> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EncodeError::InvalidPin(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PinId {
    type Error = EncodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PinId> for String {
    fn from(pin: PinId) -> Self {
        pin.0
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical actuation intent sent to a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drive a pin high or low.
    Digital { pin: PinId, level: bool },
    /// Set a PWM duty cycle. Must already be within 0-255.
    Pwm { pin: PinId, duty: u16 },
    /// Move a stepper; the sign of `steps` is the direction.
    Stepper {
        pins: Vec<PinId>,
        steps: i32,
        speed_rpm: u32,
    },
    /// Blink a pin so an operator can identify it.
    Test { pin: PinId },
}

impl Command {
    /// Build a test-pin command.
    pub fn test(pin: PinId) -> Self {
        Command::Test { pin }
    }

    /// Build a digital write command.
    pub fn digital(pin: PinId, level: bool) -> Self {
        Command::Digital { pin, level }
    }

    /// Build a PWM command from an unchecked value, clamping it into 0-255.
    ///
    /// Intended for manual requests; mappings clamp through their own
    /// `[min, max]` policy instead.
    ///
    /// # Examples
    ///
    /// ```
    /// use bluelink_bridge::wire::{Command, PinId};
    ///
    /// let cmd = Command::pwm_clamped(PinId::new("9").unwrap(), 300);
    /// assert_eq!(cmd.to_string(), "PWM:9:255");
    /// ```
    pub fn pwm_clamped(pin: PinId, value: i64) -> Self {
        let duty = value.clamp(DUTY_MIN as i64, DUTY_MAX as i64) as u16;
        Command::Pwm { pin, duty }
    }

    /// Build a stepper command.
    pub fn stepper(pins: Vec<PinId>, steps: i32, speed_rpm: u32) -> Self {
        Command::Stepper {
            pins,
            steps,
            speed_rpm,
        }
    }

    /// Wire keyword for this command.
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Digital { .. } => KEYWORD_DIGITAL,
            Command::Pwm { .. } => KEYWORD_PWM,
            Command::Stepper { .. } => KEYWORD_STEPPER,
            Command::Test { .. } => KEYWORD_TEST,
        }
    }

    /// Continuous commands (PWM levels, stepper moves) may be superseded by a
    /// newer value; discrete ones (pin edges, tests) must always be delivered.
    pub fn is_continuous(&self) -> bool {
        matches!(self, Command::Pwm { .. } | Command::Stepper { .. })
    }
}

/// Frame text without the terminator.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Test { pin } => write!(f, "{}:{}", KEYWORD_TEST, pin),
            Command::Digital { pin, level } => {
                write!(f, "{}:{}:{}", KEYWORD_DIGITAL, pin, u8::from(*level))
            }
            Command::Pwm { pin, duty } => write!(f, "{}:{}:{}", KEYWORD_PWM, pin, duty),
            Command::Stepper {
                pins,
                steps,
                speed_rpm,
            } => {
                let pins = pins
                    .iter()
                    .map(PinId::as_str)
                    .collect::<Vec<_>>()
                    .join(&PIN_LIST_SEPARATOR.to_string());
                write!(f, "{}:{}:{}:{}", KEYWORD_STEPPER, pins, steps, speed_rpm)
            }
        }
    }
}

/// A decoded reply line from a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Command accepted, optionally echoing the frame it acknowledges.
    Ack(Option<Command>),
    /// Command refused with a firmware message.
    Error(String),
}
