//! # Wire Protocol Module
//!
//! Line-oriented ASCII command protocol spoken by the BlueLink board firmware.
//!
//! This module handles:
//! - The closed set of board commands ([`protocol::Command`])
//! - Pin identifier validation
//! - Encoding commands into newline-terminated frames
//! - Decoding acknowledgement / error replies from the board

pub mod protocol;
pub mod encoder;
pub mod decoder;

pub use decoder::{decode_command, decode_reply};
pub use encoder::encode;
pub use protocol::{Command, PinId, Reply};
