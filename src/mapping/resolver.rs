//! # Mapping Resolver
//!
//! Pure translation from one controller event to zero or more board commands.
//!
//! ## Rules
//!
//! | Mode | Command | Value |
//! |------|---------|-------|
//! | Output | `DIGITAL` | `raw > midpoint(range)`, flipped by `invert` |
//! | PWM | `PWM` | `round(min + t * (max - min))`, `t` clamped to `0..=1` |
//! | Stepper | `STEPPER` | `±max(1, round(steps_per_rev * revolutions))` outside the dead zone |
//!
//! PWM rounding is half away from zero, so 0.5 over `0..=255` gives 128.
//! Stepper magnitude never accumulates across events; repeat behaviour for a
//! held input belongs to the router.

use crate::controller::ControllerEvent;
use crate::mapping::{InputRange, Mapping, PinMode};
use crate::wire::Command;

/// One command produced for one mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actuation {
    pub mapping_id: u32,
    pub input_id: String,
    pub board: String,
    pub command: Command,
}

/// Resolve an event against a mapping table
///
/// Every mapping whose input matches contributes at most one actuation, in
/// table order. Never fails: no match gives an empty vector.
///
/// # Arguments
///
/// * `event` - Controller event to resolve
/// * `mappings` - Validated mappings, usually the current table snapshot
///
/// # Examples
///
/// ```
/// use bluelink_bridge::controller::ControllerEvent;
/// use bluelink_bridge::mapping::{resolve, Mapping, PinMode};
/// use bluelink_bridge::wire::{Command, PinId};
///
/// let led = Mapping::new(1, "btn_a", "rig1", PinMode::Output { pin: PinId::new("13")? })?;
/// let actuations = resolve(&ControllerEvent::now("btn_a", 1.0), &[led]);
///
/// assert_eq!(actuations[0].board, "rig1");
/// assert_eq!(actuations[0].command, Command::digital(PinId::new("13")?, true));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn resolve(event: &ControllerEvent, mappings: &[Mapping]) -> Vec<Actuation> {
    mappings
        .iter()
        .filter(|mapping| mapping.controller_input() == event.input_id)
        .filter_map(|mapping| {
            command_for(mapping, event.raw_value).map(|command| Actuation {
                mapping_id: mapping.id(),
                input_id: event.input_id.clone(),
                board: mapping.board().to_string(),
                command,
            })
        })
        .collect()
}

/// Command a single mapping produces for `raw`, if any
pub fn command_for(mapping: &Mapping, raw: f32) -> Option<Command> {
    let range = mapping.input_range();

    match mapping.mode() {
        PinMode::Output { pin } => {
            let level = digital_level(range, raw) != mapping.invert();
            Some(Command::digital(pin.clone(), level))
        }
        PinMode::Pwm { pin, min, max } => Some(Command::Pwm {
            pin: pin.clone(),
            duty: pwm_duty(range, raw, *min, *max, mapping.invert()),
        }),
        PinMode::Stepper {
            pins,
            steps_per_rev,
            speed_rpm,
            revolutions,
            dead_zone,
        } => {
            let direction = stepper_direction(range, raw, *dead_zone)?;
            let direction = if mapping.invert() { -direction } else { direction };
            let magnitude = step_count(*steps_per_rev, *revolutions);
            Some(Command::stepper(pins.clone(), direction * magnitude, *speed_rpm))
        }
    }
}

/// `true` if `raw` lies strictly above the range midpoint
pub fn digital_level(range: InputRange, raw: f32) -> bool {
    raw > range.midpoint()
}

/// Scale `raw` into `min..=max`, rounding half away from zero
pub fn pwm_duty(range: InputRange, raw: f32, min: u8, max: u8, invert: bool) -> u16 {
    let (min, max) = (min as f32, max as f32);
    let t = range.normalized(raw);
    let scaled = (min + t * (max - min)).round().clamp(min, max);
    let duty = if invert { max - (scaled - min) } else { scaled };
    duty as u16
}

/// Direction of a stepper move: `Some(1)`, `Some(-1)`, or `None` inside the dead zone
pub fn stepper_direction(range: InputRange, raw: f32, dead_zone: f32) -> Option<i32> {
    let deflection = range.deflection(raw);
    if deflection.abs() <= dead_zone {
        return None;
    }
    Some(if deflection > 0.0 { 1 } else { -1 })
}

fn step_count(steps_per_rev: u32, revolutions: f32) -> i32 {
    let steps = (steps_per_rev as f64 * revolutions as f64).round();
    steps.clamp(1.0, i32::MAX as f64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PinId;

    fn pin(name: &str) -> PinId {
        PinId::new(name).unwrap()
    }

    fn event(input: &str, raw: f32) -> ControllerEvent {
        ControllerEvent::now(input, raw)
    }

    fn output(id: u32, input: &str, board: &str, p: &str) -> Mapping {
        Mapping::new(id, input, board, PinMode::Output { pin: pin(p) }).unwrap()
    }

    fn pwm(min: u8, max: u8, invert: bool) -> Mapping {
        Mapping::new(2, "trigger_r2", "rig1", PinMode::Pwm { pin: pin("9"), min, max })
            .unwrap()
            .inverted(invert)
            .with_range(InputRange::Unipolar { min: 0.0, max: 1.0 })
            .unwrap()
    }

    fn stepper(range: InputRange, invert: bool) -> Mapping {
        Mapping::new(
            3,
            "left_stick_x",
            "rig1",
            PinMode::Stepper {
                pins: vec![pin("8"), pin("9"), pin("10"), pin("11")],
                steps_per_rev: 200,
                speed_rpm: 60,
                revolutions: 0.5,
                dead_zone: 0.2,
            },
        )
        .unwrap()
        .inverted(invert)
        .with_range(range)
        .unwrap()
    }

    fn duty_of(actuations: &[Actuation]) -> u16 {
        match &actuations[0].command {
            Command::Pwm { duty, .. } => *duty,
            other => panic!("Expected PWM, got {:?}", other),
        }
    }

    fn steps_of(actuations: &[Actuation]) -> i32 {
        match &actuations[0].command {
            Command::Stepper { steps, .. } => *steps,
            other => panic!("Expected stepper, got {:?}", other),
        }
    }

    // ==================== Selection Tests ====================

    #[test]
    fn test_no_match_is_empty() {
        let mappings = vec![output(1, "btn_a", "rig1", "13")];
        assert!(resolve(&event("btn_b", 1.0), &mappings).is_empty());
        assert!(resolve(&event("btn_a", 1.0), &[]).is_empty());
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let mappings = vec![
            output(1, "btn_a", "rig1", "13"),
            pwm(0, 255, false),
            stepper(InputRange::Bipolar { min: 0.0, max: 255.0 }, false),
        ];
        for (input, raw) in [("btn_a", 1.0), ("trigger_r2", 0.37), ("left_stick_x", 10.0)] {
            let ev = event(input, raw);
            assert_eq!(resolve(&ev, &mappings), resolve(&ev, &mappings));
        }
    }

    #[test]
    fn test_fan_out_to_two_boards() {
        let mappings = vec![
            output(1, "btn_a", "rig1", "13"),
            output(2, "btn_b", "rig1", "12"),
            output(3, "btn_a", "rig2", "7"),
        ];

        let actuations = resolve(&event("btn_a", 1.0), &mappings);

        assert_eq!(actuations.len(), 2);
        assert_eq!(actuations[0].board, "rig1");
        assert_eq!(actuations[0].mapping_id, 1);
        assert_eq!(actuations[1].board, "rig2");
        assert_eq!(actuations[1].command, Command::digital(pin("7"), true));
        assert!(actuations.iter().all(|a| a.input_id == "btn_a"));
    }

    // ==================== Output Tests ====================

    #[test]
    fn test_output_threshold() {
        let mappings = vec![output(1, "btn_a", "rig1", "13")];

        let on = resolve(&event("btn_a", 1.0), &mappings);
        assert_eq!(on[0].command, Command::digital(pin("13"), true));

        let off = resolve(&event("btn_a", 0.0), &mappings);
        assert_eq!(off[0].command, Command::digital(pin("13"), false));

        // Exactly at the midpoint stays low
        let mid = resolve(&event("btn_a", 0.5), &mappings);
        assert_eq!(mid[0].command, Command::digital(pin("13"), false));
    }

    #[test]
    fn test_output_invert() {
        let mappings = vec![output(1, "btn_a", "rig1", "13").inverted(true)];
        let actuations = resolve(&event("btn_a", 1.0), &mappings);
        assert_eq!(actuations[0].command, Command::digital(pin("13"), false));
    }

    #[test]
    fn test_output_on_stick_range() {
        let mappings = vec![output(1, "left_stick_x", "rig1", "13")
            .with_range(InputRange::Bipolar { min: 0.0, max: 255.0 })
            .unwrap()];
        assert_eq!(
            resolve(&event("left_stick_x", 200.0), &mappings)[0].command,
            Command::digital(pin("13"), true)
        );
        assert_eq!(
            resolve(&event("left_stick_x", 100.0), &mappings)[0].command,
            Command::digital(pin("13"), false)
        );
    }

    // ==================== PWM Tests ====================

    #[test]
    fn test_pwm_endpoints_and_midpoint() {
        let mappings = vec![pwm(0, 255, false)];
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 0.0), &mappings)), 0);
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 1.0), &mappings)), 255);
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 0.5), &mappings)), 128);
    }

    #[test]
    fn test_pwm_invert() {
        let mappings = vec![pwm(0, 255, true)];
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 1.0), &mappings)), 0);
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 0.0), &mappings)), 255);
    }

    #[test]
    fn test_pwm_is_monotonic() {
        let mappings = vec![pwm(0, 255, false)];
        let mut last = 0;
        for i in 0..=100 {
            let duty = duty_of(&resolve(&event("trigger_r2", i as f32 / 100.0), &mappings));
            assert!(duty >= last, "duty decreased at step {}", i);
            last = duty;
        }
    }

    #[test]
    fn test_pwm_clamp_law() {
        for invert in [false, true] {
            let mappings = vec![pwm(40, 200, invert)];
            for raw in [-1000.0, -1.0, -0.01, 0.0, 0.3, 0.99, 1.0, 1.01, 7.0, 1e9, f32::NAN, f32::INFINITY] {
                let duty = duty_of(&resolve(&event("trigger_r2", raw), &mappings));
                assert!(
                    (40..=200).contains(&duty),
                    "raw {} invert {} gave duty {}",
                    raw,
                    invert,
                    duty
                );
            }
        }
    }

    #[test]
    fn test_pwm_sub_range_scaling() {
        let mappings = vec![pwm(100, 200, false)];
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 0.0), &mappings)), 100);
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 0.5), &mappings)), 150);
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 1.0), &mappings)), 200);
    }

    #[test]
    fn test_pwm_equal_bounds() {
        let mappings = vec![pwm(77, 77, true)];
        assert_eq!(duty_of(&resolve(&event("trigger_r2", 0.4), &mappings)), 77);
    }

    // ==================== Stepper Tests ====================

    #[test]
    fn test_stepper_direction_sign() {
        let mappings = vec![stepper(InputRange::Bipolar { min: -1.0, max: 1.0 }, false)];

        let forward = steps_of(&resolve(&event("left_stick_x", 0.9), &mappings));
        let backward = steps_of(&resolve(&event("left_stick_x", -0.9), &mappings));

        assert_eq!(forward, 100);
        assert_eq!(backward, -100);
    }

    #[test]
    fn test_stepper_magnitude_is_fixed_and_not_accumulated() {
        let mappings = vec![stepper(InputRange::Bipolar { min: -1.0, max: 1.0 }, false)];
        for raw in [0.3, 0.6, 1.0, 0.6] {
            assert_eq!(steps_of(&resolve(&event("left_stick_x", raw), &mappings)), 100);
        }
    }

    #[test]
    fn test_stepper_dead_zone() {
        let mappings = vec![stepper(InputRange::Bipolar { min: 0.0, max: 255.0 }, false)];
        // 127.5 is centre; dead zone 0.2 of deflection is about 25 counts either side
        for raw in [127.5, 110.0, 150.0] {
            assert!(
                resolve(&event("left_stick_x", raw), &mappings).is_empty(),
                "{} should be inside the dead zone",
                raw
            );
        }
        assert!(!resolve(&event("left_stick_x", 200.0), &mappings).is_empty());
    }

    #[test]
    fn test_stepper_invert() {
        let mappings = vec![stepper(InputRange::Bipolar { min: -1.0, max: 1.0 }, true)];
        assert_eq!(steps_of(&resolve(&event("left_stick_x", 1.0), &mappings)), -100);
    }

    #[test]
    fn test_stepper_on_trigger_only_moves_forward() {
        let mappings = vec![stepper(InputRange::Unipolar { min: 0.0, max: 255.0 }, false)];
        assert!(resolve(&event("left_stick_x", 0.0), &mappings).is_empty());
        assert_eq!(steps_of(&resolve(&event("left_stick_x", 255.0), &mappings)), 100);
    }

    #[test]
    fn test_stepper_command_shape() {
        let mappings = vec![stepper(InputRange::Bipolar { min: -1.0, max: 1.0 }, false)];
        let actuations = resolve(&event("left_stick_x", 1.0), &mappings);
        assert_eq!(
            actuations[0].command.to_string(),
            "STEPPER:8,9,10,11:100:60"
        );
    }

    #[test]
    fn test_step_count_has_floor_of_one() {
        assert_eq!(step_count(200, 0.001), 1);
        assert_eq!(step_count(200, 2.0), 400);
        assert_eq!(step_count(u32::MAX, 1000.0), i32::MAX);
    }
}
