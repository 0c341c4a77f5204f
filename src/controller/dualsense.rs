//! # DualSense / evdev Event Source
//!
//! Reads a game controller through the Linux evdev interface and turns raw
//! evdev events into [`ControllerEvent`]s with stable input ids.
//!
//! ## Controller Detection
//!
//! A device is picked, in order:
//! 1. The configured `device_path`, if set
//! 2. The first PS5 DualSense (vendor 0x054c, product 0x0ce6)
//! 3. The first device whose name contains the configured filter (case-insensitive)
//!
//! ## Input Ids
//!
//! | Input id | evdev code | Raw range |
//! |----------|------------|-----------|
//! | `left_stick_x` / `left_stick_y` | ABS_X / ABS_Y | 0-255 |
//! | `right_stick_x` / `right_stick_y` | ABS_Z / ABS_RZ | 0-255 |
//! | `trigger_l2` / `trigger_r2` | ABS_RX / ABS_RY | 0-255 |
//! | `dpad_x` / `dpad_y` | ABS_HAT0X / ABS_HAT0Y | -1/0/1 |
//! | `btn_cross`, `btn_circle`, `btn_square`, `btn_triangle` | BTN_SOUTH/EAST/WEST/NORTH | 0/1 |
//! | `btn_l1`, `btn_r1`, `btn_l2`, `btn_r2` | BTN_TL/TR/TL2/TR2 | 0/1 |
//! | `btn_share`, `btn_options`, `btn_ps` | BTN_SELECT/START/MODE | 0/1 |
//! | `btn_l3`, `btn_r3`, `btn_touchpad` | BTN_THUMBL/THUMBR/TOUCH | 0/1 |

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use evdev::{AbsoluteAxisType, Device, EventStream, InputEvent, InputEventKind, Key};
use tracing::{debug, info};

use super::{ControllerEvent, EventSource};
use crate::config::ControllerConfig;
use crate::error::{BridgeError, Result, SourceError};

/// PS5 DualSense vendor ID (Sony)
const DUALSENSE_VENDOR_ID: u16 = 0x054c;

/// PS5 DualSense product ID (wired and Bluetooth)
const DUALSENSE_PRODUCT_ID: u16 = 0x0ce6;

/// Key event value for autorepeat
const KEY_REPEAT: i32 = 2;

/// errno for a device that went away
const ENODEV: i32 = 19;

/// Input id for an evdev absolute axis
pub fn input_for_axis(axis: AbsoluteAxisType) -> Option<&'static str> {
    let id = match axis {
        AbsoluteAxisType::ABS_X => "left_stick_x",
        AbsoluteAxisType::ABS_Y => "left_stick_y",
        AbsoluteAxisType::ABS_Z => "right_stick_x",
        AbsoluteAxisType::ABS_RZ => "right_stick_y",
        AbsoluteAxisType::ABS_RX => "trigger_l2",
        AbsoluteAxisType::ABS_RY => "trigger_r2",
        AbsoluteAxisType::ABS_HAT0X => "dpad_x",
        AbsoluteAxisType::ABS_HAT0Y => "dpad_y",
        // Gyro, accelerometer, touchpad coordinates
        _ => return None,
    };
    Some(id)
}

/// Input id for an evdev key
pub fn input_for_key(key: Key) -> Option<&'static str> {
    let id = match key {
        Key::BTN_SOUTH => "btn_cross",
        Key::BTN_EAST => "btn_circle",
        Key::BTN_WEST => "btn_square",
        Key::BTN_NORTH => "btn_triangle",
        Key::BTN_TL => "btn_l1",
        Key::BTN_TR => "btn_r1",
        Key::BTN_TL2 => "btn_l2",
        Key::BTN_TR2 => "btn_r2",
        Key::BTN_SELECT => "btn_share",
        Key::BTN_START => "btn_options",
        Key::BTN_MODE => "btn_ps",
        Key::BTN_THUMBL => "btn_l3",
        Key::BTN_THUMBR => "btn_r3",
        Key::BTN_TOUCH => "btn_touchpad",
        _ => return None,
    };
    Some(id)
}


/// Turns raw evdev events into `(input_id, value)` pairs.
///
/// Unchanged values and key autorepeat are filtered out, so every output is
/// a real change of one input.
#[derive(Debug, Default)]
pub struct InputTranslator {
    last: HashMap<&'static str, i32>,
}

impl InputTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: &InputEvent) -> Option<(&'static str, f32)> {
        let input = match event.kind() {
            InputEventKind::AbsAxis(axis) => input_for_axis(axis)?,
            InputEventKind::Key(key) => {
                if event.value() == KEY_REPEAT {
                    return None;
                }
                input_for_key(key)?
            }
            // Sync and misc events
            _ => return None,
        };

        let value = event.value();
        if self.last.insert(input, value) == Some(value) {
            return None;
        }
        Some((input, value as f32))
    }

    /// Forget previous values, so the next event of every input is reported
    pub fn reset(&mut self) {
        self.last.clear();
    }
}

/// Event source reading a controller through evdev
pub struct EvdevSource {
    name: String,
    device_path: PathBuf,
    stream: EventStream,
    translator: InputTranslator,
}

impl EvdevSource {
    /// Open the controller described by `config`
    ///
    /// # Errors
    ///
    /// - `ControllerNotFound`: auto-detection found no matching device
    /// - `Controller`: the configured device could not be opened or streamed
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bluelink_bridge::config::ControllerConfig;
    /// use bluelink_bridge::controller::dualsense::EvdevSource;
    ///
    /// let source = EvdevSource::open(&ControllerConfig::default())?;
    /// println!("Reading {}", source.device_path().display());
    /// # Ok::<(), bluelink_bridge::error::BridgeError>(())
    /// ```
    pub fn open(config: &ControllerConfig) -> Result<Self> {
        let (device_path, device) = if config.device_path.is_empty() {
            find_controller(Path::new("/dev/input"), &config.name_filter)?
        } else {
            let path = PathBuf::from(&config.device_path);
            let device = Device::open(&path).map_err(|e| {
                BridgeError::Controller(format!("Failed to open {}: {}", path.display(), e))
            })?;
            (path, device)
        };

        let name = device.name().unwrap_or("controller").to_string();
        let stream = device.into_event_stream().map_err(|e| {
            BridgeError::Controller(format!("Failed to stream {}: {}", device_path.display(), e))
        })?;

        info!("Reading controller {:?} at {}", name, device_path.display());

        Ok(Self {
            name,
            device_path,
            stream,
            translator: InputTranslator::new(),
        })
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }
}

#[async_trait]
impl EventSource for EvdevSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> std::result::Result<Option<ControllerEvent>, SourceError> {
        loop {
            let event = match self.stream.next_event().await {
                Ok(event) => event,
                Err(e) if e.raw_os_error() == Some(ENODEV) => {
                    return Err(SourceError::Disconnected(self.name.clone()));
                }
                Err(error) => {
                    return Err(SourceError::Read {
                        source_name: self.name.clone(),
                        error,
                    });
                }
            };

            if let Some((input, value)) = self.translator.translate(&event) {
                return Ok(Some(ControllerEvent::now(input, value)));
            }
        }
    }
}

/// Scan `input_dir` for `event*` devices and pick the first controller.
fn find_controller(input_dir: &Path, name_filter: &str) -> Result<(PathBuf, Device)> {
    if !input_dir.exists() {
        return Err(BridgeError::Controller(format!(
            "{} directory not found",
            input_dir.display()
        )));
    }

    let mut paths = event_device_paths(input_dir)
        .map_err(|e| BridgeError::Controller(format!("Failed to read {}: {}", input_dir.display(), e)))?;
    // Deterministic choice when several controllers are connected
    paths.sort();

    let filter = name_filter.to_lowercase();
    let mut by_name = None;

    for path in paths {
        let device = match Device::open(&path) {
            Ok(device) => device,
            Err(e) => {
                // Permission denied or other errors - skip device
                debug!("Could not open {}: {}", path.display(), e);
                continue;
            }
        };

        let id = device.input_id();
        let name = device.name().unwrap_or_default().to_string();
        debug!(
            "Found input device: {} {:?} (vendor: 0x{:04x}, product: 0x{:04x})",
            path.display(),
            name,
            id.vendor(),
            id.product()
        );

        if id.vendor() == DUALSENSE_VENDOR_ID && id.product() == DUALSENSE_PRODUCT_ID {
            info!("Found PS5 DualSense controller at: {}", path.display());
            return Ok((path, device));
        }

        if by_name.is_none() && matches_filter(&name, &filter) {
            by_name = Some((path, device));
        }
    }

    by_name.ok_or(BridgeError::ControllerNotFound)
}

fn event_device_paths(input_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let path = entry?.path();
        let is_event = path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with("event"))
            .unwrap_or(false);
        if is_event {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn matches_filter(device_name: &str, filter: &str) -> bool {
    !filter.is_empty() && device_name.to_lowercase().contains(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::natural_range;
    use evdev::EventType;

    fn make_axis_event(axis: AbsoluteAxisType, value: i32) -> InputEvent {
        InputEvent::new(EventType::ABSOLUTE, axis.0, value)
    }

    fn make_key_event(key: Key, value: i32) -> InputEvent {
        InputEvent::new(EventType::KEY, key.code(), value)
    }

    #[test]
    fn test_dualsense_ids() {
        assert_eq!(DUALSENSE_VENDOR_ID, 0x054c, "Sony vendor ID should be 0x054c");
        assert_eq!(DUALSENSE_PRODUCT_ID, 0x0ce6, "DualSense product ID should be 0x0ce6");
    }

    // ==================== Translation Tests ====================

    #[test]
    fn test_translate_axes() {
        let mut translator = InputTranslator::new();

        assert_eq!(
            translator.translate(&make_axis_event(AbsoluteAxisType::ABS_X, 200)),
            Some(("left_stick_x", 200.0))
        );
        assert_eq!(
            translator.translate(&make_axis_event(AbsoluteAxisType::ABS_RY, 255)),
            Some(("trigger_r2", 255.0))
        );
        assert_eq!(
            translator.translate(&make_axis_event(AbsoluteAxisType::ABS_HAT0X, -1)),
            Some(("dpad_x", -1.0))
        );
    }

    #[test]
    fn test_translate_buttons() {
        let mut translator = InputTranslator::new();

        assert_eq!(
            translator.translate(&make_key_event(Key::BTN_SOUTH, 1)),
            Some(("btn_cross", 1.0))
        );
        assert_eq!(
            translator.translate(&make_key_event(Key::BTN_SOUTH, 0)),
            Some(("btn_cross", 0.0))
        );
        assert_eq!(
            translator.translate(&make_key_event(Key::BTN_MODE, 1)),
            Some(("btn_ps", 1.0))
        );
    }

    #[test]
    fn test_translate_filters_repeats_and_duplicates() {
        let mut translator = InputTranslator::new();

        assert!(translator.translate(&make_key_event(Key::BTN_TL, 1)).is_some());
        assert!(translator.translate(&make_key_event(Key::BTN_TL, KEY_REPEAT)).is_none());
        assert!(translator.translate(&make_key_event(Key::BTN_TL, 1)).is_none());

        assert!(translator.translate(&make_axis_event(AbsoluteAxisType::ABS_Y, 90)).is_some());
        assert!(translator.translate(&make_axis_event(AbsoluteAxisType::ABS_Y, 90)).is_none());
        assert!(translator.translate(&make_axis_event(AbsoluteAxisType::ABS_Y, 91)).is_some());

        translator.reset();
        assert!(translator.translate(&make_key_event(Key::BTN_TL, 1)).is_some());
    }

    #[test]
    fn test_translate_ignores_unknown_codes() {
        let mut translator = InputTranslator::new();

        assert!(translator
            .translate(&make_axis_event(AbsoluteAxisType::ABS_MT_POSITION_X, 10))
            .is_none());
        assert!(translator.translate(&make_key_event(Key::KEY_A, 1)).is_none());
        assert!(translator
            .translate(&InputEvent::new(EventType::SYNCHRONIZATION, 0, 0))
            .is_none());
    }

    // ==================== Range Tests ====================

    #[test]
    fn test_every_mapped_input_has_a_range() {
        let axes = [
            AbsoluteAxisType::ABS_X,
            AbsoluteAxisType::ABS_Y,
            AbsoluteAxisType::ABS_Z,
            AbsoluteAxisType::ABS_RZ,
            AbsoluteAxisType::ABS_RX,
            AbsoluteAxisType::ABS_RY,
            AbsoluteAxisType::ABS_HAT0X,
            AbsoluteAxisType::ABS_HAT0Y,
        ];
        for axis in axes {
            let id = input_for_axis(axis).unwrap();
            assert!(natural_range(id).is_some(), "{} has no range", id);
        }
        let id = input_for_key(Key::BTN_THUMBR).unwrap();
        assert!(natural_range(id).is_some());
    }

    // ==================== Discovery Tests ====================

    #[test]
    fn test_name_filter_matching() {
        assert!(matches_filter("Wireless Controller", "controller"));
        assert!(matches_filter("DualSense Wireless CONTROLLER", "controller"));
        assert!(!matches_filter("AT Translated Set 2 keyboard", "controller"));
        assert!(!matches_filter("Wireless Controller", ""));
    }

    #[test]
    fn test_find_controller_missing_dir() {
        let result = find_controller(Path::new("/nonexistent/input"), "controller");
        assert!(matches!(result, Err(BridgeError::Controller(_))));
    }

    #[test]
    fn test_find_controller_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mouse0"), b"").unwrap();

        let result = find_controller(dir.path(), "controller");
        assert!(matches!(result, Err(BridgeError::ControllerNotFound)));
    }

    // Integration test - only runs with real hardware
    #[tokio::test]
    #[ignore]
    async fn test_read_events_with_real_hardware() {
        let mut source = EvdevSource::open(&ControllerConfig::default()).expect("Controller not found");

        println!("Press a button on {} within 5 seconds...", source.name());

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), source.next_event())
            .await
            .expect("No events received from controller")
            .unwrap();
        println!("Received event: {:?}", event);
    }
}
