//! # Command Encoder
//!
//! Encodes [`Command`]s into newline-terminated ASCII frames.
//!
//! The encoder checks preconditions but never repairs values: clamping is a
//! mapping policy, so an out-of-range duty here is a bug upstream.

use std::collections::HashSet;

use super::protocol::*;
use crate::error::EncodeError;

/// Encode a command into a complete frame
///
/// # Arguments
///
/// * `command` - Command to encode
///
/// # Returns
///
/// * `Result<Vec<u8>, EncodeError>` - Frame bytes including the trailing `\n`
///
/// # Errors
///
/// Returns error if:
/// - PWM duty is above 255
/// - Stepper speed is 0
/// - Stepper pin list is empty, longer than 4, or repeats a pin
///
/// # Examples
///
/// ```
/// use bluelink_bridge::wire::{encode, Command, PinId};
///
/// let frame = encode(&Command::Pwm { pin: PinId::new("9").unwrap(), duty: 128 }).unwrap();
/// assert_eq!(frame, b"PWM:9:128\n");
/// ```
pub fn encode(command: &Command) -> Result<Vec<u8>, EncodeError> {
    validate(command)?;

    let text = command.to_string();
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(FRAME_TERMINATOR);

    Ok(frame)
}

/// Check wire preconditions without encoding.
pub fn validate(command: &Command) -> Result<(), EncodeError> {
    match command {
        Command::Pwm { duty, .. } => {
            if *duty > DUTY_MAX {
                return Err(EncodeError::OutOfRange {
                    field: "duty",
                    value: *duty as i64,
                    min: DUTY_MIN as i64,
                    max: DUTY_MAX as i64,
                });
            }
        }
        Command::Stepper {
            pins, speed_rpm, ..
        } => {
            if *speed_rpm == 0 {
                return Err(EncodeError::OutOfRange {
                    field: "speed_rpm",
                    value: 0,
                    min: 1,
                    max: u32::MAX as i64,
                });
            }
            validate_stepper_pins(pins)?;
        }
        Command::Digital { .. } | Command::Test { .. } => {}
    }

    Ok(())
}

fn validate_stepper_pins(pins: &[PinId]) -> Result<(), EncodeError> {
    if pins.is_empty() || pins.len() > STEPPER_MAX_PINS {
        return Err(EncodeError::StepperPins(format!(
            "expected 1 to {} pins, got {}",
            STEPPER_MAX_PINS,
            pins.len()
        )));
    }

    let mut seen = HashSet::with_capacity(pins.len());
    for pin in pins {
        if !seen.insert(pin) {
            return Err(EncodeError::StepperPins(format!("pin {} repeated", pin)));
        }
    }

    Ok(())
}
