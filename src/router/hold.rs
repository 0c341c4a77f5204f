//! Stepper hold policy.
//!
//! The resolver emits one fixed-size stepper move per qualifying event. What
//! happens while a stick or trigger stays deflected is decided here:
//!
//! - `EveryEvent`: every qualifying event moves the motor
//! - `Edge`: move once when the input leaves the dead zone or changes direction
//! - `Repeat`: like `Edge`, plus the held input is re-resolved every interval

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{RouterConfig, StepperHoldMode};
use crate::controller::ControllerEvent;
use crate::mapping::resolver::command_for;
use crate::mapping::{Actuation, Mapping};
use crate::wire::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepperHold {
    EveryEvent,
    #[default]
    Edge,
    /// Held inputs re-fire against the mapping they engaged, so editing or
    /// removing that mapping releases the hold.
    Repeat { interval: Duration },
}

impl From<&RouterConfig> for StepperHold {
    fn from(config: &RouterConfig) -> Self {
        match config.stepper_hold {
            StepperHoldMode::EveryEvent => StepperHold::EveryEvent,
            StepperHoldMode::Edge => StepperHold::Edge,
            StepperHoldMode::Repeat => StepperHold::Repeat {
                interval: Duration::from_millis(config.repeat_interval_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Held {
    direction: i32,
    raw_value: f32,
    /// Mapping as it was when the hold engaged
    mapping: Mapping,
}

/// Tracks which stepper mappings are currently deflected, per router path.
#[derive(Debug, Default)]
pub struct HoldTracker {
    policy: StepperHold,
    // (input_id, mapping_id)
    engaged: BTreeMap<(String, u32), Held>,
}

impl HoldTracker {
    pub fn new(policy: StepperHold) -> Self {
        Self {
            policy,
            engaged: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> StepperHold {
        self.policy
    }

    /// Repeat interval, if the policy re-fires held inputs
    pub fn repeat_interval(&self) -> Option<Duration> {
        match self.policy {
            StepperHold::Repeat { interval } => Some(interval),
            _ => None,
        }
    }

    /// Apply the policy to the actuations resolved for `event`.
    ///
    /// Non-stepper actuations always pass through.
    pub fn filter(
        &mut self,
        event: &ControllerEvent,
        mappings: &[Mapping],
        actuations: Vec<Actuation>,
    ) -> Vec<Actuation> {
        if self.policy == StepperHold::EveryEvent {
            return actuations;
        }

        // Stepper mappings on this input that produced nothing are back in the dead zone
        for mapping in mappings {
            if mapping.controller_input() != event.input_id || !mapping.mode().is_stepper() {
                continue;
            }
            let fired = actuations.iter().any(|a| a.mapping_id == mapping.id());
            if !fired {
                self.engaged.remove(&(event.input_id.clone(), mapping.id()));
            }
        }

        actuations
            .into_iter()
            .filter(|actuation| {
                let Some(direction) = step_direction(&actuation.command) else {
                    return true;
                };
                let Some(mapping) = mappings.iter().find(|m| m.id() == actuation.mapping_id) else {
                    return true;
                };
                let key = (actuation.input_id.clone(), actuation.mapping_id);
                let held = Held {
                    direction,
                    raw_value: event.raw_value,
                    mapping: mapping.clone(),
                };
                match self.engaged.insert(key, held) {
                    Some(previous) => previous.direction != direction,
                    None => true,
                }
            })
            .collect()
    }

    /// Re-resolve every held input against the current mappings.
    ///
    /// Holds whose mapping was removed or edited since they engaged are
    /// released without firing. A held value is never re-resolved against a
    /// mapping it did not engage.
    pub fn repeat(&mut self, mappings: &[Mapping]) -> Vec<Actuation> {
        if self.repeat_interval().is_none() {
            return Vec::new();
        }

        let mut actuations = Vec::new();
        self.engaged.retain(|(input_id, mapping_id), held| {
            let mapping = mappings
                .iter()
                .find(|m| m.id() == *mapping_id && m.controller_input() == input_id);
            let Some(mapping) = mapping else {
                return false;
            };
            if *mapping != held.mapping {
                return false;
            }
            match command_for(mapping, held.raw_value) {
                Some(command) => {
                    if let Some(direction) = step_direction(&command) {
                        held.direction = direction;
                    }
                    actuations.push(Actuation {
                        mapping_id: *mapping_id,
                        input_id: input_id.clone(),
                        board: mapping.board().to_string(),
                        command,
                    });
                    true
                }
                None => false,
            }
        });

        actuations
    }

    /// Number of inputs currently held outside the dead zone
    pub fn engaged(&self) -> usize {
        self.engaged.len()
    }
}

fn step_direction(command: &Command) -> Option<i32> {
    match command {
        Command::Stepper { steps, .. } => Some(steps.signum()),
        _ => None,
    }
}
