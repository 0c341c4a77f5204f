//! # Mapping Module
//!
//! Validated links between one controller input and one board pin (or pin set).
//!
//! This module handles:
//! - The [`Mapping`] record and its [`PinMode`] variants
//! - Declared input ranges ([`InputRange`]) used for thresholds and scaling
//! - Converting flat configuration records into validated mappings
//! - The [`MappingStore`] snapshot holder the router reads from
//!
//! A [`Mapping`] can only be built through validation, so the resolver never
//! sees a malformed pin configuration.

pub mod resolver;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::MappingError;
use crate::wire::protocol::DUTY_MAX;
use crate::wire::PinId;

pub use resolver::{resolve, Actuation};

/// Default steps per revolution for stepper mappings (1.8° motors)
pub const DEFAULT_STEPS_PER_REV: u32 = 200;
/// Default stepper speed
pub const DEFAULT_SPEED_RPM: u32 = 60;
/// Default revolutions per qualifying event
pub const DEFAULT_REVOLUTIONS: f32 = 1.0;
/// Default stepper dead zone (fraction of full deflection)
pub const DEFAULT_DEAD_ZONE: f32 = 0.1;

/// Raw stick and trigger range reported by the controller
pub const AXIS_MIN: f32 = 0.0;
pub const AXIS_MAX: f32 = 255.0;

/// Declared value range of a controller input.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputRange {
    /// Buttons: 0 released, 1 pressed
    #[default]
    Digital,
    /// Triggers: neutral at `min`, full travel at `max`
    Unipolar { min: f32, max: f32 },
    /// Sticks and d-pads: neutral at the centre of `min..max`
    Bipolar { min: f32, max: f32 },
}

impl InputRange {
    /// `(low, high)` bounds of the range
    pub fn bounds(&self) -> (f32, f32) {
        match *self {
            InputRange::Digital => (0.0, 1.0),
            InputRange::Unipolar { min, max } | InputRange::Bipolar { min, max } => (min, max),
        }
    }

    /// Threshold used for digital outputs
    pub fn midpoint(&self) -> f32 {
        let (lo, hi) = self.bounds();
        lo + (hi - lo) / 2.0
    }

    /// Position of `raw` within the range, clamped to `0.0..=1.0`.
    ///
    /// Non-finite input reads as the low end, except `+inf` which reads as 1.
    pub fn normalized(&self, raw: f32) -> f32 {
        let (lo, hi) = self.bounds();
        let t = (raw - lo) / (hi - lo);
        if t.is_nan() {
            return 0.0;
        }
        t.clamp(0.0, 1.0)
    }

    /// Signed distance from the neutral point.
    ///
    /// Bipolar ranges give `-1.0..=1.0` with 0 at the centre; the others give
    /// `0.0..=1.0` with 0 at rest.
    pub fn deflection(&self, raw: f32) -> f32 {
        let t = self.normalized(raw);
        match self {
            InputRange::Bipolar { .. } => t * 2.0 - 1.0,
            InputRange::Digital | InputRange::Unipolar { .. } => t,
        }
    }

    fn validate(&self, id: u32) -> Result<(), MappingError> {
        let (min, max) = self.bounds();
        if !min.is_finite() || !max.is_finite() || max <= min {
            return Err(MappingError::InputRange { id, min, max });
        }
        Ok(())
    }
}

/// Natural range of a known controller input
///
/// Mappings for these inputs get this range unless they declare their own.
///
/// # Examples
///
/// ```
/// use bluelink_bridge::mapping::{natural_range, InputRange};
///
/// assert_eq!(natural_range("trigger_r2"), Some(InputRange::Unipolar { min: 0.0, max: 255.0 }));
/// assert_eq!(natural_range("btn_cross"), Some(InputRange::Digital));
/// assert_eq!(natural_range("websocket_slider"), None);
/// ```
pub fn natural_range(input_id: &str) -> Option<InputRange> {
    let range = match input_id {
        "left_stick_x" | "left_stick_y" | "right_stick_x" | "right_stick_y" => {
            InputRange::Bipolar { min: AXIS_MIN, max: AXIS_MAX }
        }
        "trigger_l2" | "trigger_r2" => InputRange::Unipolar { min: AXIS_MIN, max: AXIS_MAX },
        "dpad_x" | "dpad_y" => InputRange::Bipolar { min: -1.0, max: 1.0 },
        id if id.starts_with("btn_") => InputRange::Digital,
        _ => return None,
    };
    Some(range)
}

/// How a mapping drives its board pins.
#[derive(Debug, Clone, PartialEq)]
pub enum PinMode {
    /// Digital on/off
    Output { pin: PinId },
    /// PWM duty scaled into `min..=max`
    Pwm { pin: PinId, min: u8, max: u8 },
    /// One fixed-size move per qualifying event
    Stepper {
        pins: Vec<PinId>,
        steps_per_rev: u32,
        speed_rpm: u32,
        /// Revolutions per move, so steps = steps_per_rev * revolutions
        revolutions: f32,
        /// Deflection band around neutral that never moves the motor
        dead_zone: f32,
    },
}

impl PinMode {
    /// Mode name as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            PinMode::Output { .. } => "output",
            PinMode::Pwm { .. } => "pwm",
            PinMode::Stepper { .. } => "stepper",
        }
    }

    pub fn is_stepper(&self) -> bool {
        matches!(self, PinMode::Stepper { .. })
    }

    fn validate(&self, id: u32) -> Result<(), MappingError> {
        match self {
            PinMode::Output { .. } => Ok(()),
            PinMode::Pwm { min, max, .. } => {
                if min > max {
                    return Err(MappingError::PwmRange {
                        id,
                        min: *min as u16,
                        max: *max as u16,
                    });
                }
                Ok(())
            }
            PinMode::Stepper {
                pins,
                steps_per_rev,
                speed_rpm,
                revolutions,
                dead_zone,
            } => {
                if pins.len() != 2 && pins.len() != 4 {
                    return Err(MappingError::StepperPinCount {
                        id,
                        count: pins.len(),
                    });
                }
                let mut seen = HashSet::with_capacity(pins.len());
                for pin in pins {
                    if !seen.insert(pin) {
                        return Err(MappingError::DuplicateStepperPin {
                            id,
                            pin: pin.to_string(),
                        });
                    }
                }
                if *steps_per_rev == 0 {
                    return Err(MappingError::NotPositive { id, field: "steps_per_rev" });
                }
                if *speed_rpm == 0 {
                    return Err(MappingError::NotPositive { id, field: "speed_rpm" });
                }
                if !revolutions.is_finite() || *revolutions <= 0.0 {
                    return Err(MappingError::NotPositive { id, field: "revolutions" });
                }
                if !(0.0..1.0).contains(dead_zone) {
                    return Err(MappingError::DeadZone { id, value: *dead_zone });
                }
                Ok(())
            }
        }
    }
}

/// A validated controller-input to board-pin mapping.
///
/// Immutable once built; editing a mapping means replacing it in the
/// [`MappingStore`].
///
/// # Examples
///
/// ```
/// use bluelink_bridge::mapping::{Mapping, PinMode};
/// use bluelink_bridge::wire::PinId;
///
/// let led = Mapping::new(1, "btn_cross", "rig1", PinMode::Output { pin: PinId::new("13")? })?;
/// assert_eq!(led.controller_input(), "btn_cross");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "MappingConfig")]
pub struct Mapping {
    id: u32,
    controller_input: String,
    board: String,
    invert: bool,
    input_range: InputRange,
    mode: PinMode,
}

impl Mapping {
    /// Build a mapping with a digital input range and no inversion
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] if the input or board name is empty, or the
    /// pin mode parameters are invalid.
    pub fn new(
        id: u32,
        controller_input: impl Into<String>,
        board: impl Into<String>,
        mode: PinMode,
    ) -> Result<Self, MappingError> {
        let controller_input = controller_input.into();
        let board = board.into();

        if controller_input.trim().is_empty() {
            return Err(MappingError::EmptyInput { id });
        }
        if board.trim().is_empty() {
            return Err(MappingError::EmptyBoard { id });
        }
        mode.validate(id)?;

        Ok(Self {
            id,
            controller_input,
            board,
            invert: false,
            input_range: InputRange::Digital,
            mode,
        })
    }

    /// Flip the output direction
    #[must_use]
    pub fn inverted(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    /// Declare the input's value range
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::InputRange`] if the range is empty or not finite.
    pub fn with_range(mut self, range: InputRange) -> Result<Self, MappingError> {
        range.validate(self.id)?;
        self.input_range = range;
        Ok(self)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn controller_input(&self) -> &str {
        &self.controller_input
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn invert(&self) -> bool {
        self.invert
    }

    pub fn input_range(&self) -> InputRange {
        self.input_range
    }

    pub fn mode(&self) -> &PinMode {
        &self.mode
    }
}

/// Flat mapping record as it appears in configuration files.
///
/// ```toml
/// [[mappings]]
/// id = 3
/// input = "left_stick_x"
/// board = "rig1"
/// mode = "stepper"
/// pins = ["8", "9", "10", "11"]
/// range = { kind = "bipolar", min = 0.0, max = 255.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub id: u32,
    pub input: String,
    pub board: String,

    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default)]
    pub pin: Option<String>,

    #[serde(default)]
    pub invert: bool,

    /// Defaults to the input's natural range for known controller inputs,
    /// otherwise digital
    #[serde(default)]
    pub range: Option<InputRange>,

    // PWM
    #[serde(default)]
    pub min: Option<u16>,
    #[serde(default)]
    pub max: Option<u16>,

    // Stepper
    #[serde(default)]
    pub pins: Vec<String>,
    #[serde(default)]
    pub steps_per_rev: Option<u32>,
    #[serde(default)]
    pub speed_rpm: Option<u32>,
    #[serde(default)]
    pub revolutions: Option<f32>,
    #[serde(default)]
    pub dead_zone: Option<f32>,
}

fn default_mode() -> String { "output".to_string() }

impl MappingConfig {
    fn primary_pin(&self) -> Result<PinId, MappingError> {
        let pin = self
            .pin
            .clone()
            .ok_or(MappingError::MissingField { id: self.id, field: "pin" })?;
        PinId::new(pin).map_err(|source| MappingError::Pin { id: self.id, source })
    }
}

impl TryFrom<MappingConfig> for Mapping {
    type Error = MappingError;

    fn try_from(config: MappingConfig) -> Result<Self, Self::Error> {
        let id = config.id;

        let mode = match config.mode.trim().to_ascii_lowercase().as_str() {
            "output" | "digital" => PinMode::Output {
                pin: config.primary_pin()?,
            },
            "pwm" => {
                let min = config.min.unwrap_or(0);
                let max = config.max.unwrap_or(DUTY_MAX);
                if min > max || max > DUTY_MAX {
                    return Err(MappingError::PwmRange { id, min, max });
                }
                PinMode::Pwm {
                    pin: config.primary_pin()?,
                    min: min as u8,
                    max: max as u8,
                }
            }
            "stepper" => {
                if config.pins.is_empty() {
                    return Err(MappingError::MissingField { id, field: "pins" });
                }
                let pins = config
                    .pins
                    .iter()
                    .map(|pin| PinId::new(pin.as_str()).map_err(|source| MappingError::Pin { id, source }))
                    .collect::<Result<Vec<_>, _>>()?;
                PinMode::Stepper {
                    pins,
                    steps_per_rev: config.steps_per_rev.unwrap_or(DEFAULT_STEPS_PER_REV),
                    speed_rpm: config.speed_rpm.unwrap_or(DEFAULT_SPEED_RPM),
                    revolutions: config.revolutions.unwrap_or(DEFAULT_REVOLUTIONS),
                    dead_zone: config.dead_zone.unwrap_or(DEFAULT_DEAD_ZONE),
                }
            }
            other => {
                return Err(MappingError::UnknownMode {
                    id,
                    mode: other.to_string(),
                })
            }
        };

        Mapping::new(id, config.input.clone(), config.board, mode)?
            .inverted(config.invert)
            .with_range(
                config
                    .range
                    .or_else(|| natural_range(&config.input))
                    .unwrap_or_default(),
            )
    }
}

/// A validated set of mappings with unique ids, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTable {
    mappings: Vec<Mapping>,
}

impl MappingTable {
    /// # Errors
    ///
    /// Returns [`MappingError::DuplicateId`] if two mappings share an id.
    pub fn new(mappings: Vec<Mapping>) -> Result<Self, MappingError> {
        let mut ids = HashSet::with_capacity(mappings.len());
        for mapping in &mappings {
            if !ids.insert(mapping.id) {
                return Err(MappingError::DuplicateId(mapping.id));
            }
        }
        Ok(Self { mappings })
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn get(&self, id: u32) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Copy of this table with `mapping` replacing the entry with the same id,
    /// or appended if the id is new.
    #[must_use]
    pub fn with_mapping(&self, mapping: Mapping) -> Self {
        let mut mappings = self.mappings.clone();
        match mappings.iter_mut().find(|m| m.id == mapping.id) {
            Some(existing) => *existing = mapping,
            None => mappings.push(mapping),
        }
        Self { mappings }
    }

    /// Copy of this table without mapping `id`.
    #[must_use]
    pub fn without_mapping(&self, id: u32) -> Self {
        Self {
            mappings: self.mappings.iter().filter(|m| m.id != id).cloned().collect(),
        }
    }
}

/// Holder of the current mapping table snapshot.
///
/// Readers take an `Arc` snapshot per event; writers publish a whole new
/// table. Subscribers are notified on every change.
#[derive(Debug)]
pub struct MappingStore {
    current: watch::Sender<Arc<MappingTable>>,
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new(MappingTable::default())
    }
}

impl MappingStore {
    pub fn new(table: MappingTable) -> Self {
        let (current, _) = watch::channel(Arc::new(table));
        Self { current }
    }

    /// Current table
    pub fn snapshot(&self) -> Arc<MappingTable> {
        self.current.borrow().clone()
    }

    /// Receiver that always sees the latest table
    pub fn subscribe(&self) -> watch::Receiver<Arc<MappingTable>> {
        self.current.subscribe()
    }

    /// Publish a whole new table
    pub fn replace(&self, table: MappingTable) {
        self.current.send_replace(Arc::new(table));
    }

    /// Add or replace one mapping
    pub fn upsert(&self, mapping: Mapping) {
        self.current
            .send_modify(|table| *table = Arc::new(table.with_mapping(mapping)));
    }

    /// Remove one mapping, returning whether it existed
    pub fn remove(&self, id: u32) -> bool {
        let mut removed = false;
        self.current.send_if_modified(|table| {
            if table.get(id).is_none() {
                return false;
            }
            *table = Arc::new(table.without_mapping(id));
            removed = true;
            true
        });
        removed
    }
}
