//! # BlueLink Bridge Library
//!
//! Drive Arduino-class boards from a game controller over serial.
//!
//! Controller events (buttons, sticks, triggers) are resolved against a
//! table of mappings into board commands (digital writes, PWM duty cycles,
//! stepper moves) and dispatched over per-board serial links.
//!
//! - [`wire`]: the line-oriented board protocol
//! - [`serial`]: serial links and the board registry
//! - [`mapping`]: mapping model and the pure resolver
//! - [`controller`]: event sources, including DualSense via evdev
//! - [`router`]: per-source processing paths with backpressure
//! - [`firmware`]: firmware upload through `arduino-cli`

pub mod config;
pub mod error;
pub mod wire;
pub mod serial;
pub mod mapping;
pub mod controller;
pub mod router;
pub mod firmware;
