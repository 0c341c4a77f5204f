//! # Reply Decoder
//!
//! Decodes lines received from the board. Decoding is best-effort: anything
//! unrecognised becomes [`DecodeError::Malformed`] for the caller to log.

use super::protocol::*;
use crate::error::DecodeError;

/// Decode a reply line (`OK`, `OK:<frame>`, `ERR:<message>`)
///
/// # Arguments
///
/// * `line` - Raw line bytes, with or without the trailing `\n` / `\r\n`
///
/// # Returns
///
/// * `Result<Reply, DecodeError>` - Decoded reply, or error if unrecognised
///
/// # Examples
///
/// ```
/// use bluelink_bridge::wire::{decode_reply, Reply};
///
/// assert_eq!(decode_reply(b"OK\r\n").unwrap(), Reply::Ack(None));
/// assert_eq!(decode_reply(b"ERR:bad pin\n").unwrap(), Reply::Error("bad pin".into()));
/// ```
pub fn decode_reply(line: &[u8]) -> Result<Reply, DecodeError> {
    let text = line_text(line)?;

    if text == REPLY_OK {
        return Ok(Reply::Ack(None));
    }

    match text.split_once(FIELD_SEPARATOR) {
        Some((REPLY_OK, echo)) => Ok(Reply::Ack(Some(parse_command(echo)?))),
        Some((REPLY_ERR, message)) => Ok(Reply::Error(message.trim().to_string())),
        _ if text == REPLY_ERR => Ok(Reply::Error(String::new())),
        _ => Err(malformed(text, "unknown reply")),
    }
}

/// Decode a command frame such as `PWM:9:128\n`
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] if the keyword is unknown, the field
/// count is wrong, or a field does not parse.
pub fn decode_command(line: &[u8]) -> Result<Command, DecodeError> {
    parse_command(line_text(line)?)
}

fn line_text(line: &[u8]) -> Result<&str, DecodeError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| DecodeError::Malformed(format!("non UTF-8 bytes: {:02X?}", line)))?;
    let text = text.trim_end_matches(['\r', '\n']);

    if text.is_empty() {
        return Err(DecodeError::Malformed("empty line".to_string()));
    }

    Ok(text)
}

fn parse_command(text: &str) -> Result<Command, DecodeError> {
    let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();

    match fields.as_slice() {
        [KEYWORD_TEST, pin] => Ok(Command::Test {
            pin: parse_pin(text, pin)?,
        }),
        [KEYWORD_DIGITAL, pin, level] => {
            let level = match *level {
                "0" => false,
                "1" => true,
                _ => return Err(malformed(text, "digital level must be 0 or 1")),
            };
            Ok(Command::Digital {
                pin: parse_pin(text, pin)?,
                level,
            })
        }
        [KEYWORD_PWM, pin, duty] => {
            let duty: u16 = duty
                .parse()
                .map_err(|_| malformed(text, "duty is not a number"))?;
            if duty > DUTY_MAX {
                return Err(malformed(text, "duty above 255"));
            }
            Ok(Command::Pwm {
                pin: parse_pin(text, pin)?,
                duty,
            })
        }
        [KEYWORD_STEPPER, pins, steps, speed] => {
            let pins = pins
                .split(PIN_LIST_SEPARATOR)
                .map(|pin| parse_pin(text, pin))
                .collect::<Result<Vec<_>, _>>()?;
            let steps = steps
                .parse()
                .map_err(|_| malformed(text, "steps is not a number"))?;
            let speed_rpm = speed
                .parse()
                .map_err(|_| malformed(text, "speed is not a number"))?;
            Ok(Command::Stepper {
                pins,
                steps,
                speed_rpm,
            })
        }
        _ => Err(malformed(text, "unknown command or wrong field count")),
    }
}

fn parse_pin(text: &str, pin: &str) -> Result<PinId, DecodeError> {
    PinId::new(pin).map_err(|_| malformed(text, "invalid pin"))
}

fn malformed(text: &str, reason: &str) -> DecodeError {
    DecodeError::Malformed(format!("{}: {:?}", reason, text))
}
